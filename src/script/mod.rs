//! PowerShell provisioning scripts compiled from customization operations.
//!
//! An [`Operation`] is one post-install change (registry, directory,
//! document, package). [`compile_operations`] turns a list of them into a
//! [`ProvisioningScript`]; [`ScriptCompiler`] additionally appends it to the
//! profile's user script and registers the profile in the index.
//!
//! Every emitted line ends with `\r\n`: the scripts run on the Windows guest.

mod compiler;
mod profile;

pub use compiler::{compile_operations, ProvisioningScript, ScriptCompiler};
pub use profile::Profile;

use std::fmt;

use thiserror::Error;

/// Line terminator of every emitted command.
pub const CRLF: &str = "\r\n";

/// Modification kind carried by registry, directory and document operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModType {
    Add,
    Modify,
    Delete,
    /// Anything else found in an overlay file or on the command line.
    Unrecognized(String),
}

impl ModType {
    pub fn parse(s: &str) -> Self {
        match s {
            "add" => ModType::Add,
            "modify" => ModType::Modify,
            "delete" => ModType::Delete,
            other => ModType::Unrecognized(other.to_string()),
        }
    }
}

impl fmt::Display for ModType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModType::Add => write!(f, "add"),
            ModType::Modify => write!(f, "modify"),
            ModType::Delete => write!(f, "delete"),
            ModType::Unrecognized(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    RegistryEdit {
        modtype: ModType,
        key: String,
        name: Option<String>,
        value: Option<String>,
        valuetype: Option<String>,
    },
    DirectoryOp {
        modtype: ModType,
        path: String,
    },
    DocumentOp {
        modtype: ModType,
        path: String,
    },
    PackageInstall {
        name: String,
    },
}

/// Why an operation produced no command line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidOperation {
    #[error("{kind} modification type '{modtype}' is invalid. Valid ones are: {valid}")]
    UnknownModType {
        kind: &'static str,
        modtype: String,
        valid: &'static str,
    },

    #[error("{kind} '{modtype}' requires a {field}")]
    MissingField {
        kind: &'static str,
        modtype: ModType,
        field: &'static str,
    },
}

impl Operation {
    /// Short label used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::RegistryEdit { .. } => "registry",
            Operation::DirectoryOp { .. } => "directory",
            Operation::DocumentOp { .. } => "document",
            Operation::PackageInstall { .. } => "package",
        }
    }

    /// The PowerShell command for this operation, without terminator.
    pub fn command(&self) -> Result<String, InvalidOperation> {
        match self {
            Operation::RegistryEdit {
                modtype,
                key,
                name,
                value,
                valuetype,
            } => {
                let require = |field: &'static str, v: &Option<String>| {
                    v.clone().ok_or_else(|| InvalidOperation::MissingField {
                        kind: "registry",
                        modtype: modtype.clone(),
                        field,
                    })
                };
                match modtype {
                    ModType::Add => Ok(format!(
                        "New-ItemProperty -Path \"{key}\" -Name \"{}\" -Value \"{}\" -PropertyType \"{}\"",
                        require("name", name)?,
                        require("value", value)?,
                        require("valuetype", valuetype)?,
                    )),
                    ModType::Modify => Ok(format!(
                        "Set-ItemProperty -Path \"{key}\" -Name \"{}\" -Value \"{}\"",
                        require("name", name)?,
                        require("value", value)?,
                    )),
                    ModType::Delete => Ok(match name {
                        Some(name) => format!("Remove-ItemProperty -Path \"{key}\" -Name \"{name}\""),
                        None => format!("Remove-Item -Path \"{key}\" -Recurse"),
                    }),
                    ModType::Unrecognized(other) => Err(InvalidOperation::UnknownModType {
                        kind: "registry",
                        modtype: other.clone(),
                        valid: "add, delete and modify",
                    }),
                }
            }
            Operation::DirectoryOp { modtype, path } => match modtype {
                ModType::Add => Ok(format!("New-Item -Path \"{path}\" -ItemType \"directory\"")),
                ModType::Delete => Ok(format!("Remove-Item -Path \"{path}\" -Recurse")),
                other => Err(InvalidOperation::UnknownModType {
                    kind: "directory",
                    modtype: other.to_string(),
                    valid: "add and delete",
                }),
            },
            Operation::DocumentOp { modtype, path } => match modtype {
                ModType::Add => Ok(format!("New-Item -Path \"{path}\" -ItemType \"file\"")),
                ModType::Delete => Ok(format!("Remove-Item -Path \"{path}\"")),
                other => Err(InvalidOperation::UnknownModType {
                    kind: "document",
                    modtype: other.to_string(),
                    valid: "add and delete",
                }),
            },
            Operation::PackageInstall { name } => Ok(format!("cinst {name} -y")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(modtype: &str, name: Option<&str>, value: Option<&str>, valuetype: Option<&str>) -> Operation {
        Operation::RegistryEdit {
            modtype: ModType::parse(modtype),
            key: r"HKLM:\SOFTWARE\Malboxes".into(),
            name: name.map(String::from),
            value: value.map(String::from),
            valuetype: valuetype.map(String::from),
        }
    }

    #[test]
    fn registry_commands() {
        assert_eq!(
            reg("add", Some("Debugger"), Some("1"), Some("DWORD")).command().unwrap(),
            r#"New-ItemProperty -Path "HKLM:\SOFTWARE\Malboxes" -Name "Debugger" -Value "1" -PropertyType "DWORD""#
        );
        assert_eq!(
            reg("modify", Some("Debugger"), Some("0"), None).command().unwrap(),
            r#"Set-ItemProperty -Path "HKLM:\SOFTWARE\Malboxes" -Name "Debugger" -Value "0""#
        );
        assert_eq!(
            reg("delete", Some("Debugger"), None, None).command().unwrap(),
            r#"Remove-ItemProperty -Path "HKLM:\SOFTWARE\Malboxes" -Name "Debugger""#
        );
        assert_eq!(
            reg("delete", None, None, None).command().unwrap(),
            r#"Remove-Item -Path "HKLM:\SOFTWARE\Malboxes" -Recurse"#
        );
    }

    #[test]
    fn registry_add_needs_a_type() {
        let err = reg("add", Some("x"), Some("1"), None).command().unwrap_err();
        assert!(matches!(
            err,
            InvalidOperation::MissingField {
                field: "valuetype",
                ..
            }
        ));
    }

    #[test]
    fn directory_and_document_differ_in_item_type() {
        let dir = Operation::DirectoryOp {
            modtype: ModType::Add,
            path: r"C:\mlbxs".into(),
        };
        let doc = Operation::DocumentOp {
            modtype: ModType::Add,
            path: r"C:\mlbxs\notes.txt".into(),
        };
        assert_eq!(
            dir.command().unwrap(),
            r#"New-Item -Path "C:\mlbxs" -ItemType "directory""#
        );
        assert_eq!(
            doc.command().unwrap(),
            r#"New-Item -Path "C:\mlbxs\notes.txt" -ItemType "file""#
        );
    }

    #[test]
    fn modify_is_not_valid_for_paths() {
        let op = Operation::DirectoryOp {
            modtype: ModType::Modify,
            path: "C:\\x".into(),
        };
        let err = op.command().unwrap_err();
        assert!(err.to_string().contains("add and delete"));
    }

    #[test]
    fn package_install_is_unattended() {
        let op = Operation::PackageInstall {
            name: "thunderbird".into(),
        };
        assert_eq!(op.command().unwrap(), "cinst thunderbird -y");
    }

    #[test]
    fn modtype_parsing_is_exact() {
        assert_eq!(ModType::parse("add"), ModType::Add);
        assert_eq!(ModType::parse("Add"), ModType::Unrecognized("Add".into()));
    }
}
