//! `PlistBuddy` edits against a UTM bundle's `config.plist`.

use super::ConfigPatch;

pub const PLIST_BUDDY: &str = "/usr/libexec/PlistBuddy";

/// The creation script attaches the install ISO as the first drive.
const INSTALL_DRIVE_INDEX: usize = 0;

/// Commands for one patch. `clear` entries remove keys that may not exist
/// and are run on their own so a missing key does not abort `apply`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlistEdit {
    pub clear: Vec<String>,
    pub apply: Vec<String>,
}

pub fn edit_for(patch: &ConfigPatch) -> PlistEdit {
    match patch {
        ConfigPatch::SerialConsole { port } => PlistEdit {
            clear: vec!["Delete :Serial".into()],
            apply: vec![
                "Add :Serial array".into(),
                "Add :Serial:0 dict".into(),
                "Add :Serial:0:Mode string TcpServer".into(),
                "Add :Serial:0:Target string Auto".into(),
                format!("Add :Serial:0:TcpPort integer {port}"),
                "Add :Serial:0:WaitForConnection bool false".into(),
            ],
        },
        ConfigPatch::MacAddress(mac) => PlistEdit {
            clear: Vec::new(),
            apply: vec![format!("Set :Network:0:MacAddress {mac}")],
        },
        ConfigPatch::MemoryMib(mib) => PlistEdit {
            clear: Vec::new(),
            apply: vec![format!("Set :System:MemorySize {mib}")],
        },
        ConfigPatch::CpuCount(cpus) => PlistEdit {
            clear: Vec::new(),
            apply: vec![format!("Set :System:CPUCount {cpus}")],
        },
        ConfigPatch::DetachInstallMedia => PlistEdit {
            clear: Vec::new(),
            apply: vec![format!("Delete :Drive:{INSTALL_DRIVE_INDEX}")],
        },
    }
}

/// `PlistBuddy` prints a plain value for `Print`; anything else means absent.
pub fn parse_print(stdout: &str) -> Option<String> {
    let value = stdout.trim();
    if value.is_empty() || value.starts_with("Print: Entry") {
        None
    } else {
        Some(value.to_string())
    }
}
