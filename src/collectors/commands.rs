use super::runner::CommandLine;

/// A diagnostic tool run during collection. Its stdout lands in
/// `<label>.txt`, its stderr in `<label>.err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticCommand {
    pub label: &'static str,
    pub program: &'static str,
    pub args: &'static [&'static str],
}

impl DiagnosticCommand {
    const fn new(label: &'static str, program: &'static str, args: &'static [&'static str]) -> Self {
        Self {
            label,
            program,
            args,
        }
    }

    pub fn command_line(&self) -> CommandLine {
        CommandLine::new(self.program).args(self.args.iter().copied())
    }

    pub fn stdout_name(&self) -> String {
        format!("{}.txt", self.label)
    }

    pub fn stderr_name(&self) -> String {
        format!("{}.err", self.label)
    }
}

pub const DIAGNOSTIC_COMMANDS: &[DiagnosticCommand] = &[
    DiagnosticCommand::new("dmidecode", "dmidecode", &[]),
    DiagnosticCommand::new("free-m", "free", &["-m"]),
    DiagnosticCommand::new("lsblk", "lsblk", &[]),
    DiagnosticCommand::new("lspci", "lspci", &[]),
    DiagnosticCommand::new("lspci-vv", "lspci", &["-vv"]),
    DiagnosticCommand::new("lspci-vvnnqD", "lspci", &["-vvnnqD"]),
    DiagnosticCommand::new("lshw", "lshw", &[]),
    DiagnosticCommand::new("lscpu", "lscpu", &[]),
    DiagnosticCommand::new("lsmod", "lsmod", &[]),
    DiagnosticCommand::new("nvme-list", "nvme", &["list"]),
    DiagnosticCommand::new("ls-dev-disk-by-id", "ls", &["-l", "/dev/disk/by-id"]),
    DiagnosticCommand::new("ls-dev-disk-by-path", "ls", &["-l", "/dev/disk/by-path"]),
    DiagnosticCommand::new("ls-sys-class-net", "ls", &["-l", "/sys/class/net"]),
    DiagnosticCommand::new("ip-address-list", "ip", &["address", "list"]),
    DiagnosticCommand::new("ip-link-list", "ip", &["link", "list"]),
    DiagnosticCommand::new("lsusb", "lsusb", &[]),
];

/// Renders the batch as an equivalent shell script. Only kept in the bundle
/// as a record of what ran; it is never executed.
pub fn render_script(commands: &[DiagnosticCommand], sudo: bool) -> String {
    let mut out = String::from("#!/bin/sh\n");
    for cmd in commands {
        let mut line = cmd.command_line();
        if sudo {
            line = line.with_sudo();
        }
        out.push_str(&shell_quote(&line.program));
        for arg in &line.args {
            out.push(' ');
            out.push_str(&shell_quote(arg));
        }
        out.push_str(&format!(
            " > {} 2> {}\n",
            shell_quote(&cmd.stdout_name()),
            shell_quote(&cmd.stderr_name())
        ));
    }
    out
}

fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '=' | ':'));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
