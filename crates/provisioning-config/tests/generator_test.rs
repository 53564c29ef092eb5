//! End-to-end tests for provisioning document generation

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use goldenpipe_common::{BuildRequest, Customizations, OsType, UserConfig};
use provisioning_config::{
    generate, generate_linux_config, generate_windows_config, CloudConfig,
};

fn decode(data: &str) -> String {
    String::from_utf8(STANDARD.decode(data).expect("valid base64")).expect("valid utf-8")
}

fn linux_request() -> BuildRequest {
    let mut req = BuildRequest::new("web01", OsType::Linux, "https://iso.example/ubuntu.iso");
    let mut custom = Customizations {
        packages: vec!["nginx".to_string(), "jq".to_string()],
        scripts: vec![
            "systemctl enable nginx".to_string(),
            "echo done > /var/log/build.log".to_string(),
        ],
        users: vec![UserConfig {
            name: "deploy".to_string(),
            password: None,
            groups: vec!["adm".to_string()],
            sudo: true,
        }],
        ssh_keys: vec!["ssh-ed25519 AAAAC3Nza deploy@example".to_string()],
        ..Default::default()
    };
    custom
        .files
        .insert("/etc/nginx/conf.d/site.conf".to_string(), "server {\n  listen 80;\n}".to_string());
    custom
        .files
        .insert("/etc/motd".to_string(), "golden".to_string());
    req.customizations = Some(custom);
    req
}

fn windows_request(scripts: &[&str]) -> BuildRequest {
    let mut req = BuildRequest::new("win01", OsType::Windows, "https://iso.example/win2022.iso");
    req.customizations = Some(Customizations {
        scripts: scripts.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    });
    req
}

#[test]
fn test_linux_config_is_deterministic() {
    let req = linux_request();

    let first = generate_linux_config(&req);
    let second = generate_linux_config(&req.clone());

    assert_eq!(first, second);
    assert_eq!(decode(&first.0), decode(&second.0));
}

#[test]
fn test_linux_sections_follow_fixed_order() {
    let doc = decode(&generate_linux_config(&linux_request()).0);

    let markers = [
        "# Install packages",
        "# Custom packages",
        "# Users",
        "# SSH keys",
        "# Custom files",
        "# Custom scripts",
        "# Golden image creation script",
    ];
    let positions: Vec<usize> = markers
        .iter()
        .map(|m| doc.find(m).unwrap_or_else(|| panic!("missing {m}")))
        .collect();

    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{positions:?}");
}

#[test]
fn test_custom_packages_emit_second_packages_key() {
    // Known quirk: custom packages are appended as a second top-level
    // `packages:` key instead of being merged into the baseline list.
    let req = linux_request();
    let doc = decode(&generate_linux_config(&req).0);

    assert_eq!(doc.matches("\npackages:\n").count(), 2);
    assert!(doc.contains("\n# Custom packages\npackages:\n  - nginx\n  - jq\n"));
    assert_eq!(
        CloudConfig::for_request(&req).keys(),
        vec![
            "packages",
            "packages",
            "users",
            "ssh_authorized_keys",
            "write_files",
            "runcmd",
            "runcmd",
        ]
    );
}

#[test]
fn test_files_are_emitted_in_path_order() {
    let doc = decode(&generate_linux_config(&linux_request()).0);

    let motd = doc.find("  - path: /etc/motd").unwrap();
    let nginx = doc.find("  - path: /etc/nginx/conf.d/site.conf").unwrap();
    assert!(motd < nginx);
    assert!(doc.contains("    content: |\n      server {\n        listen 80;\n      }\n"));
}

#[test]
fn test_scripts_and_keys_are_verbatim() {
    let doc = decode(&generate_linux_config(&linux_request()).0);

    assert!(doc.contains(
        "\n# Custom scripts\nruncmd:\n  - systemctl enable nginx\n  - echo done > /var/log/build.log\n"
    ));
    assert!(doc.contains(
        "\n# SSH keys\nssh_authorized_keys:\n  - ssh-ed25519 AAAAC3Nza deploy@example\n"
    ));
}

#[test]
fn test_sanitization_runs_last_and_powers_off() {
    let doc = decode(&generate_linux_config(&linux_request()).0);
    let tail = &doc[doc.find("# Golden image creation script").unwrap()..];

    for step in [
        "sleep 30",
        "apt-get install -y qemu-utils cloud-guest-utils",
        "cloud-init clean --logs",
        "rm -f /etc/machine-id",
        "rm -f /etc/ssh/ssh_host_*",
        "rm -rf /var/lib/cloud/instances/*",
        "journalctl --vacuum-time=1s",
        "systemd-machine-id-setup",
        "touch /tmp/golden-image-ready",
    ] {
        assert!(tail.contains(step), "missing {step}");
    }
    assert!(tail.ends_with("poweroff\n"));
}

#[test]
fn test_network_data_is_dhcp_on_eth0() {
    let (_, network) = generate_linux_config(&linux_request());

    assert_eq!(
        decode(&network),
        "version: 2\nethernets:\n  eth0:\n    dhcp4: true\n    dhcp6: false\n"
    );
}

#[test]
fn test_windows_scripts_inserted_before_closing_tag() {
    let doc = decode(&generate_windows_config(&windows_request(&[
        "Install-WindowsFeature Web-Server",
        "Set-TimeZone -Id UTC",
    ])));

    let expected = concat!(
        "                    <Order>2</Order>\n",
        "                    <Path>powershell -Command \"Enable-WindowsOptionalFeature -Online -FeatureName Microsoft-Hyper-V-All -All\"</Path>\n",
        "                </RunSynchronousCommand>\n",
        "            \n",
        "                <RunSynchronousCommand wcm:action=\"add\">\n",
        "                    <Order>3</Order>\n",
        "                    <Path>powershell -Command \"Install-WindowsFeature Web-Server\"</Path>\n",
        "                </RunSynchronousCommand>\n",
        "                <RunSynchronousCommand wcm:action=\"add\">\n",
        "                    <Order>4</Order>\n",
        "                    <Path>powershell -Command \"Set-TimeZone -Id UTC\"</Path>\n",
        "                </RunSynchronousCommand>\n",
        "            </RunSynchronous>\n",
    );
    assert!(doc.contains(expected), "{doc}");
}

#[test]
fn test_windows_without_scripts_keeps_builtins() {
    let with_none = decode(&generate_windows_config(&windows_request(&[])));
    let without_custom = decode(&generate_windows_config(&BuildRequest::new(
        "win01",
        OsType::Windows,
        "https://iso.example/win2022.iso",
    )));

    assert_eq!(with_none, without_custom);
    assert!(!with_none.contains("<Order>3</Order>"));
    assert!(with_none.contains(
        "                </RunSynchronousCommand>\n            </RunSynchronous>\n        </component>"
    ));
}

#[test]
fn test_windows_script_text_is_not_escaped() {
    let doc = decode(&generate_windows_config(&windows_request(&["Write-Host \"a<b\""])));

    assert!(doc.contains("<Path>powershell -Command \"Write-Host \"a<b\"\"</Path>"));
}

#[test]
fn test_generate_branches_on_os_type() {
    let linux = generate(&linux_request());
    assert!(linux.network_data.is_some());
    assert!(decode(&linux.user_data).starts_with("#cloud-config\n"));

    let windows = generate(&windows_request(&[]));
    assert!(windows.network_data.is_none());
    assert!(decode(&windows.user_data).starts_with("<?xml"));
}
