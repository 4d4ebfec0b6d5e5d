//! seccomp profile handling
//!
//! Translates the OCI seccomp block into the engine's native policy format:
//! a version header, an `allowlist` line carrying the default action, one
//! bracketed section per architecture and one rule line per syscall. A
//! syscall with argument comparisons expands to one line per argument
//! because the engine forbids multiple comparisons of the same argument
//! index within a single rule.

use crate::{
    error::Result,
    oci_spec::{Arch, LinuxSeccomp, LinuxSeccompAction, LinuxSyscall},
};
use anyhow::Context;
use log::warn;
use std::{fs, path::Path};

#[cfg(target_arch = "x86_64")]
const NATIVE_ARCH: Option<Arch> = Some(Arch::X86_64);
#[cfg(target_arch = "x86")]
const NATIVE_ARCH: Option<Arch> = Some(Arch::X86);
#[cfg(target_arch = "aarch64")]
const NATIVE_ARCH: Option<Arch> = Some(Arch::AARCH64);
#[cfg(target_arch = "arm")]
const NATIVE_ARCH: Option<Arch> = Some(Arch::ARM);
#[cfg(target_arch = "riscv64")]
const NATIVE_ARCH: Option<Arch> = Some(Arch::RISCV64);
#[cfg(target_arch = "s390x")]
const NATIVE_ARCH: Option<Arch> = Some(Arch::S390X);
#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "aarch64",
    target_arch = "arm",
    target_arch = "riscv64",
    target_arch = "s390x"
)))]
const NATIVE_ARCH: Option<Arch> = None;

/// Whether the seccomp block carries any syscall rules worth a profile.
pub fn has_rules(seccomp: &LinuxSeccomp) -> bool {
    seccomp.syscalls().as_ref().map_or(false, |s| !s.is_empty())
}

/// Write the profile for `seccomp` to `path`.
pub fn write_profile(seccomp: &LinuxSeccomp, path: &Path) -> Result<()> {
    let profile = render(seccomp);
    fs::write(path, profile)
        .with_context(|| format!("write seccomp profile {}", path.display()))?;
    Ok(())
}

/// Render the engine-native policy text.
pub fn render(seccomp: &LinuxSeccomp) -> String {
    let mut out = String::from("2\n");
    out.push_str(&format!(
        "allowlist {}\n",
        action_token(seccomp.default_action())
    ));

    let syscalls: &[LinuxSyscall] = seccomp
        .syscalls()
        .as_ref()
        .map_or(&[], |s| s.as_slice());

    for arch in profile_arches(seccomp) {
        out.push_str(&format!("[{}]\n", arch_token(arch)));
        for syscall in syscalls {
            for line in rule_lines(syscall) {
                out.push_str(&line);
                out.push('\n');
            }
        }
    }
    out
}

/// The architecture sections to emit. When the spec includes the host's
/// native architecture only that one is emitted; the engine synthesizes
/// the compat architectures itself.
fn profile_arches(seccomp: &LinuxSeccomp) -> Vec<Arch> {
    let listed = seccomp
        .architectures()
        .as_ref()
        .cloned()
        .unwrap_or_default();
    match NATIVE_ARCH {
        Some(native) if listed.is_empty() => vec![native],
        Some(native) if listed.contains(&native) => vec![native],
        _ => listed,
    }
}

/// One policy line per syscall name, or per (name, argument) pair.
fn rule_lines(syscall: &LinuxSyscall) -> Vec<String> {
    let action = action_token(syscall.action());
    let mut lines = Vec::new();
    for name in syscall.names() {
        match syscall.args() {
            Some(args) if !args.is_empty() => {
                for arg in args {
                    let mut compare =
                        format!("[{},{},{}", arg.index(), arg.value(), arg.op().as_scmp_str());
                    if let Some(value_two) = arg.value_two() {
                        compare.push_str(&format!(",{}", value_two));
                    }
                    compare.push(']');
                    lines.push(format!("{} {} {}", name, action, compare));
                }
            }
            _ => lines.push(format!("{} {}", name, action)),
        }
    }
    lines
}

/// Map an OCI seccomp action to the engine action token. `trace` and `log`
/// are not supported by the engine and fall back to `kill`.
fn action_token(action: LinuxSeccompAction) -> &'static str {
    match action {
        LinuxSeccompAction::Kill | LinuxSeccompAction::KillProcess => "kill",
        LinuxSeccompAction::Trap => "trap",
        LinuxSeccompAction::Errno => "errno 0",
        LinuxSeccompAction::Allow => "allow",
        LinuxSeccompAction::Trace | LinuxSeccompAction::Log => {
            warn!("seccomp action {:?} is not supported, using kill", action);
            "kill"
        }
    }
}

fn arch_token(arch: Arch) -> &'static str {
    match arch {
        Arch::X86 => "x86",
        Arch::X86_64 => "x86_64",
        Arch::X32 => "x32",
        Arch::ARM => "arm",
        Arch::AARCH64 => "aarch64",
        Arch::MIPS => "mips",
        Arch::MIPS64 => "mips64",
        Arch::MIPSEL => "mipsel",
        Arch::MIPSEL64 => "mipsel64",
        Arch::PPC => "ppc",
        Arch::PPC64 => "ppc64",
        Arch::PPC64LE => "ppc64le",
        Arch::S390 => "s390",
        Arch::S390X => "s390x",
        Arch::RISCV64 => "riscv64",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci_spec::{
        LinuxSeccompArgBuilder, LinuxSeccompBuilder, LinuxSeccompOperator, LinuxSyscallBuilder,
    };
    use anyhow::Result;

    fn kill_profile(syscalls: Vec<LinuxSyscall>) -> Result<LinuxSeccomp> {
        Ok(LinuxSeccompBuilder::default()
            .default_action(LinuxSeccompAction::Kill)
            .syscalls(syscalls)
            .build()?)
    }

    #[test]
    fn header_carries_default_action() -> Result<()> {
        let profile = render(&kill_profile(vec![])?);
        let mut lines = profile.lines();
        assert_eq!(lines.next(), Some("2"));
        assert_eq!(lines.next(), Some("allowlist kill"));
        Ok(())
    }

    #[test]
    fn errno_default_action() -> Result<()> {
        let seccomp = LinuxSeccompBuilder::default()
            .default_action(LinuxSeccompAction::Errno)
            .build()?;
        assert!(render(&seccomp).contains("allowlist errno 0"));
        Ok(())
    }

    #[test]
    fn trace_and_log_fall_back_to_kill() -> Result<()> {
        for action in [LinuxSeccompAction::Trace, LinuxSeccompAction::Log].iter() {
            let seccomp = LinuxSeccompBuilder::default()
                .default_action(*action)
                .build()?;
            assert!(render(&seccomp).contains("allowlist kill"));
        }
        Ok(())
    }

    #[test]
    fn one_line_per_argument() -> Result<()> {
        let args = (0..3)
            .map(|index| {
                LinuxSeccompArgBuilder::default()
                    .index(index as usize)
                    .value(index as u64)
                    .op(LinuxSeccompOperator::EqualTo)
                    .build()
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let syscall = LinuxSyscallBuilder::default()
            .names(vec!["personality".to_string()])
            .action(LinuxSeccompAction::Allow)
            .args(args)
            .build()?;

        let profile = render(&kill_profile(vec![syscall])?);
        let rules: Vec<&str> = profile
            .lines()
            .filter(|l| l.starts_with("personality "))
            .collect();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0], "personality allow [0,0,SCMP_CMP_EQ]");
        Ok(())
    }

    #[test]
    fn argument_with_second_value() -> Result<()> {
        let arg = LinuxSeccompArgBuilder::default()
            .index(1usize)
            .value(0xff_u64)
            .value_two(0x0f_u64)
            .op(LinuxSeccompOperator::MaskedEqual)
            .build()?;
        let syscall = LinuxSyscallBuilder::default()
            .names(vec!["ioctl".to_string()])
            .action(LinuxSeccompAction::Allow)
            .args(vec![arg])
            .build()?;

        let profile = render(&kill_profile(vec![syscall])?);
        assert!(profile.contains("ioctl allow [1,255,SCMP_CMP_MASKED_EQ,15]"));
        Ok(())
    }

    #[test]
    fn syscall_without_args_is_one_line() -> Result<()> {
        let syscall = LinuxSyscallBuilder::default()
            .names(vec!["mount".to_string(), "umount2".to_string()])
            .action(LinuxSeccompAction::Errno)
            .build()?;

        let profile = render(&kill_profile(vec![syscall])?);
        assert!(profile.contains("mount errno 0\n"));
        assert!(profile.contains("umount2 errno 0\n"));
        Ok(())
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn native_arch_wins_over_compat() -> Result<()> {
        let seccomp = LinuxSeccompBuilder::default()
            .default_action(LinuxSeccompAction::Kill)
            .architectures(vec![Arch::X86_64, Arch::X86, Arch::X32])
            .build()?;
        let profile = render(&seccomp);
        assert!(profile.contains("[x86_64]"));
        assert!(!profile.contains("[x86]\n"));
        assert!(!profile.contains("[x32]"));
        Ok(())
    }

    #[test]
    fn foreign_arches_are_kept() -> Result<()> {
        let seccomp = LinuxSeccompBuilder::default()
            .default_action(LinuxSeccompAction::Kill)
            .architectures(vec![Arch::MIPS, Arch::PPC64LE])
            .build()?;
        let profile = render(&seccomp);
        assert!(profile.contains("[mips]"));
        assert!(profile.contains("[ppc64le]"));
        Ok(())
    }

    #[test]
    fn profile_is_written() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("seccomp.conf");
        write_profile(&kill_profile(vec![])?, &path)?;
        assert!(fs::read_to_string(&path)?.starts_with("2\n"));
        Ok(())
    }
}
