//! AppleScript snippets for the parts of UTM that have no CLI verb.

use super::VmSpec;

/// Escape a value for use inside an AppleScript string literal.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Script creating a QEMU VM with the install ISO as its first (removable)
/// drive and a blank disk as its second.
pub fn create_vm(spec: &VmSpec, architecture: &str) -> String {
    let iso = quote(&spec.iso.to_string_lossy());
    let name = quote(&spec.name);
    let arch = quote(architecture);
    let disk_mib = spec.disk_gib * 1024;
    format!(
        "tell application \"UTM\"\n\
         \tset iso to POSIX file {iso}\n\
         \tmake new virtual machine with properties {{backend:qemu, configuration:{{name:{name}, architecture:{arch}, memory:{memory}, cpu cores:{cpus}, drives:{{{{removable:true, source:iso}}, {{guest size:{disk_mib}}}}}, network interfaces:{{{{mode:{mode}}}}}}}}}\n\
         end tell\n",
        memory = spec.memory_mib,
        cpus = spec.cpus,
        mode = spec.network.as_str(),
    )
}

pub fn quit_app(app: &str) -> String {
    format!("tell application {} to quit", quote(app))
}
