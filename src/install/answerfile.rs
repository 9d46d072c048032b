use std::fmt::Write;

/// Inputs for an Alpine `setup-alpine -f` answer file.
#[derive(Debug, Clone)]
pub struct AnswerFileSpec<'a> {
    pub hostname: &'a str,
    pub disk: &'a str,
    pub timezone: &'a str,
    /// Installed as root's authorized key at install time, when present.
    pub root_ssh_key: Option<&'a str>,
}

impl Default for AnswerFileSpec<'_> {
    fn default() -> Self {
        Self {
            hostname: "alpine",
            disk: "/dev/vda",
            timezone: "UTC",
            root_ssh_key: None,
        }
    }
}

/// Render the answer file: DHCP networking, OpenSSH, one sys-mode disk.
pub fn render(spec: &AnswerFileSpec<'_>) -> String {
    let mut out = String::new();
    let mut line = |key: &str, value: &str| {
        let _ = writeln!(out, "{key}=\"{value}\"");
    };

    line("KEYMAPOPTS", "us us");
    line("HOSTNAMEOPTS", &format!("-n {}", spec.hostname));
    line("DEVDOPTS", "mdev");
    line(
        "INTERFACESOPTS",
        &format!(
            "auto lo\niface lo inet loopback\n\nauto eth0\niface eth0 inet dhcp\n    hostname {}\n",
            spec.hostname
        ),
    );
    line("TIMEZONEOPTS", &format!("-z {}", spec.timezone));
    line("PROXYOPTS", "none");
    line("APKREPOSOPTS", "-1");
    line("USEROPTS", "none");
    line("SSHDOPTS", "-c openssh");
    if let Some(key) = spec.root_ssh_key {
        line("ROOTSSHKEY", key.trim());
    }
    line("NTPOPTS", "-c busybox");
    line("DISKOPTS", &format!("-m sys {}", spec.disk));
    line("LBUOPTS", "none");
    line("APKCACHEOPTS", "none");
    out
}
