//! Cloud-init user data for Linux builder VMs
//!
//! The document is assembled as an ordered list of sections and only then
//! rendered to text. Sections are appended, never merged: when custom
//! packages are given the output carries two top-level `packages:` keys.

use goldenpipe_common::{BuildRequest, UserConfig};

use crate::templates::{NETWORK_CONFIG, SANITIZE_SCRIPT};

/// Packages installed on every Linux image
pub const BASELINE_PACKAGES: [&str; 6] = ["curl", "wget", "git", "vim", "htop", "cloud-utils"];

const PREAMBLE: [&str; 3] = ["#cloud-config", "package_update: true", "package_upgrade: true"];

const SUDO_ALL: &str = "ALL=(ALL) NOPASSWD:ALL";

/// One `key: value` line inside a list entry
#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Value(&'static str, String),
    /// `key: |` followed by the text, one indented line per source line
    Literal(&'static str, String),
}

/// One `- ...` item of a top-level list
#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Scalar(String),
    Fields(Vec<Field>),
    /// `- |` followed by pre-indented text emitted verbatim
    Block(&'static str),
}

/// A commented top-level list key
#[derive(Debug, Clone, PartialEq, Eq)]
struct Section {
    comment: &'static str,
    key: &'static str,
    entries: Vec<Entry>,
}

impl Section {
    fn new(comment: &'static str, key: &'static str) -> Self {
        Self {
            comment,
            key,
            entries: Vec::new(),
        }
    }

    fn scalars<I, S>(comment: &'static str, key: &'static str, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut section = Self::new(comment, key);
        section.entries = items
            .into_iter()
            .map(|item| Entry::Scalar(item.into()))
            .collect();
        section
    }

    fn render(&self, out: &mut String) {
        out.push('\n');
        out.push_str("# ");
        out.push_str(self.comment);
        out.push('\n');
        out.push_str(self.key);
        out.push_str(":\n");

        for entry in &self.entries {
            render_entry(entry, out);
        }
    }
}

fn render_entry(entry: &Entry, out: &mut String) {
    match entry {
        Entry::Scalar(value) => {
            out.push_str("  - ");
            out.push_str(value);
            out.push('\n');
        }
        Entry::Fields(fields) => {
            for (idx, field) in fields.iter().enumerate() {
                out.push_str(if idx == 0 { "  - " } else { "    " });
                match field {
                    Field::Value(key, value) => {
                        out.push_str(key);
                        out.push_str(": ");
                        out.push_str(value);
                        out.push('\n');
                    }
                    Field::Literal(key, text) => {
                        out.push_str(key);
                        out.push_str(": |\n");
                        for line in text.split('\n') {
                            out.push_str("      ");
                            out.push_str(line);
                            out.push('\n');
                        }
                    }
                }
            }
        }
        Entry::Block(text) => {
            out.push_str("  - |\n");
            out.push_str(text);
        }
    }
}

/// Cloud-config document in emission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudConfig {
    sections: Vec<Section>,
}

impl CloudConfig {
    /// Build the section list for a request
    pub fn for_request(req: &BuildRequest) -> Self {
        let mut sections = vec![Section::scalars(
            "Install packages",
            "packages",
            BASELINE_PACKAGES,
        )];

        if let Some(custom) = req.customizations() {
            if !custom.packages.is_empty() {
                sections.push(Section::scalars(
                    "Custom packages",
                    "packages",
                    custom.packages.iter().cloned(),
                ));
            }

            if !custom.users.is_empty() {
                let mut users = Section::new("Users", "users");
                users.entries = custom.users.iter().map(user_entry).collect();
                sections.push(users);
            }

            if !custom.ssh_keys.is_empty() {
                sections.push(Section::scalars(
                    "SSH keys",
                    "ssh_authorized_keys",
                    custom.ssh_keys.iter().cloned(),
                ));
            }

            if !custom.files.is_empty() {
                let mut files = Section::new("Custom files", "write_files");
                files.entries = custom
                    .files
                    .iter()
                    .map(|(path, content)| {
                        Entry::Fields(vec![
                            Field::Value("path", path.clone()),
                            Field::Literal("content", content.clone()),
                        ])
                    })
                    .collect();
                sections.push(files);
            }

            if !custom.scripts.is_empty() {
                sections.push(Section::scalars(
                    "Custom scripts",
                    "runcmd",
                    custom.scripts.iter().cloned(),
                ));
            }
        }

        let mut sanitize = Section::new("Golden image creation script", "runcmd");
        sanitize.entries.push(Entry::Block(SANITIZE_SCRIPT));
        sections.push(sanitize);

        Self { sections }
    }

    /// Top-level keys in emission order, duplicates included
    pub fn keys(&self) -> Vec<&'static str> {
        self.sections.iter().map(|section| section.key).collect()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in PREAMBLE {
            out.push_str(line);
            out.push('\n');
        }
        for section in &self.sections {
            section.render(&mut out);
        }
        out
    }
}

fn user_entry(user: &UserConfig) -> Entry {
    let mut fields = vec![Field::Value("name", user.name.clone())];

    if let Some(password) = user.password.as_deref().filter(|p| !p.is_empty()) {
        fields.push(Field::Value("passwd", password.to_string()));
    }
    if !user.groups.is_empty() {
        fields.push(Field::Value("groups", user.groups.join(",")));
    }
    if user.sudo {
        fields.push(Field::Value("sudo", SUDO_ALL.to_string()));
    }

    Entry::Fields(fields)
}

/// Plain-text user data for a Linux build
pub fn render_user_data(req: &BuildRequest) -> String {
    CloudConfig::for_request(req).render()
}

/// Plain-text network data for a Linux build
pub fn render_network_data() -> &'static str {
    NETWORK_CONFIG
}
