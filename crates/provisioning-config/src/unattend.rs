//! Unattended-install XML for Windows builder VMs

use goldenpipe_common::BuildRequest;

use crate::templates::{UNATTEND_HEAD, UNATTEND_TAIL};

/// Commands every Windows build runs first, at orders 1 and 2
pub const BUILTIN_COMMANDS: [&str; 2] = [
    r#"powershell -Command "Set-ExecutionPolicy -ExecutionPolicy RemoteSigned -Force""#,
    r#"powershell -Command "Enable-WindowsOptionalFeature -Online -FeatureName Microsoft-Hyper-V-All -All""#,
];

/// Order index given to the first custom script
pub const FIRST_SCRIPT_ORDER: usize = BUILTIN_COMMANDS.len() + 1;

/// Whitespace-only line between the built-in commands and the first script
const SCRIPT_SEPARATOR: &str = "\n            ";

/// An entry of the specialize pass `RunSynchronous` block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynchronousCommand {
    pub order: usize,
    pub path: String,
}

impl SynchronousCommand {
    fn render(&self, out: &mut String) {
        out.push_str("\n                <RunSynchronousCommand wcm:action=\"add\">");
        out.push_str(&format!("\n                    <Order>{}</Order>", self.order));
        out.push_str(&format!("\n                    <Path>{}</Path>", self.path));
        out.push_str("\n                </RunSynchronousCommand>");
    }
}

/// Built-in commands followed by the request's scripts. Script text is
/// wrapped in a PowerShell invocation as given, without escaping.
pub fn synchronous_commands(req: &BuildRequest) -> Vec<SynchronousCommand> {
    let builtins = BUILTIN_COMMANDS
        .iter()
        .enumerate()
        .map(|(idx, path)| SynchronousCommand {
            order: idx + 1,
            path: (*path).to_string(),
        });

    let scripts = req
        .customizations()
        .map(|custom| custom.scripts.as_slice())
        .unwrap_or_default()
        .iter()
        .enumerate()
        .map(|(idx, script)| SynchronousCommand {
            order: FIRST_SCRIPT_ORDER + idx,
            path: format!("powershell -Command \"{}\"", script),
        });

    builtins.chain(scripts).collect()
}

/// Plain-text unattend document for a Windows build
pub fn render_user_data(req: &BuildRequest) -> String {
    let mut out = String::from(UNATTEND_HEAD);
    for command in synchronous_commands(req) {
        if command.order == FIRST_SCRIPT_ORDER {
            out.push_str(SCRIPT_SEPARATOR);
        }
        command.render(&mut out);
    }
    out.push_str(UNATTEND_TAIL);
    out
}
