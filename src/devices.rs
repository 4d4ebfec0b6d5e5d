//! Device node policy
//!
//! The engine never manages devices on its own (`autodev = 0`). Depending
//! on whether the caller holds CAP_MKNOD the translated spec either carries
//! a `devices.txt` side file that the engine hook `mknod`s from, or the
//! mount list is rewritten to bind every requested device into a fresh
//! tmpfs at `/dev`.

use crate::{
    engine::ConfigItem,
    error::Result,
    oci_spec::{LinuxDeviceBuilder, Mount, MountBuilder, Spec},
};
use anyhow::Context;
use std::{fs, path::Path};

/// Devices every container gets, mode 0666, owned by the container process.
const DEFAULT_DEVICES: [(&str, i64, i64); 6] = [
    ("/dev/null", 1, 3),
    ("/dev/zero", 1, 5),
    ("/dev/full", 1, 7),
    ("/dev/random", 1, 8),
    ("/dev/urandom", 1, 9),
    ("/dev/tty", 5, 0),
];

/// Whether this process may create device nodes.
pub fn can_mknod() -> bool {
    capctl::caps::CapState::get_current()
        .map(|state| state.effective.has(capctl::caps::Cap::MKNOD))
        .unwrap_or(false)
}

/// Add any missing mandatory default device to the spec.
pub fn ensure_default_devices(spec: &mut Spec) -> Result<()> {
    let (uid, gid) = process_owner(spec);
    let linux = spec.linux_mut().get_or_insert_with(Default::default);
    let devices = linux.devices_mut().get_or_insert_with(Vec::new);

    for (path, major, minor) in DEFAULT_DEVICES.iter() {
        if devices.iter().any(|d| d.path() == Path::new(path)) {
            continue;
        }
        devices.push(
            LinuxDeviceBuilder::default()
                .path(*path)
                .typ("c")
                .major(*major)
                .minor(*minor)
                .file_mode(0o666u32)
                .uid(uid)
                .gid(gid)
                .build()
                .with_context(|| format!("build default device {}", path))?,
        );
    }
    Ok(())
}

/// Device cgroup permission entries: a leading deny-all, an allow entry per
/// device node, the pty pair the engine needs, and the spec's own device
/// allowlist.
pub fn cgroup_items(spec: &Spec) -> Vec<ConfigItem> {
    let mut items = vec![ConfigItem::new("cgroup2.devices.deny", "a")];

    if let Some(devices) = spec.linux().as_ref().and_then(|l| l.devices().as_ref()) {
        for device in devices {
            items.push(ConfigItem::new(
                "cgroup2.devices.allow",
                format!("{} {}:{} rwm", device.typ(), device.major(), device.minor()),
            ));
        }
    }

    // /dev/ptmx and the devpts slaves.
    items.push(ConfigItem::new("cgroup2.devices.allow", "c 5:2 rwm"));
    items.push(ConfigItem::new("cgroup2.devices.allow", "c 136:* rwm"));

    if let Some(rules) = spec
        .linux()
        .as_ref()
        .and_then(|l| l.resources().as_ref())
        .and_then(|r| r.devices().as_ref())
    {
        for rule in rules {
            let key = if rule.allow() {
                "cgroup2.devices.allow"
            } else {
                "cgroup2.devices.deny"
            };
            let major = rule
                .major()
                .map(|major| major.to_string())
                .unwrap_or_else(|| "*".to_string());
            let minor = rule
                .minor()
                .map(|minor| minor.to_string())
                .unwrap_or_else(|| "*".to_string());
            items.push(ConfigItem::new(
                key,
                format!(
                    "{} {}:{} {}",
                    rule.typ().as_deref().unwrap_or("a"),
                    major,
                    minor,
                    rule.access().as_deref().unwrap_or("rwm"),
                ),
            ));
        }
    }
    items
}

/// Write `devices.txt` for the engine hook: one `path type major minor mode
/// uid:gid` line per device.
pub fn write_device_list(spec: &Spec, path: &Path) -> Result<()> {
    let (uid, gid) = process_owner(spec);
    let mut out = String::new();
    if let Some(devices) = spec.linux().as_ref().and_then(|l| l.devices().as_ref()) {
        for device in devices {
            out.push_str(&format!(
                "{} {} {} {} {:o} {}:{}\n",
                device.path().display(),
                device.typ(),
                device.major(),
                device.minor(),
                device.file_mode().unwrap_or(0o666),
                device.uid().unwrap_or(uid),
                device.gid().unwrap_or(gid),
            ));
        }
    }
    fs::write(path, out).with_context(|| format!("write device list {}", path.display()))?;
    Ok(())
}

/// Without CAP_MKNOD the spec's `/dev` mounts are replaced by a fresh tmpfs
/// plus one bind mount per requested device.
pub fn bind_mount_fallback(spec: &mut Spec) -> Result<()> {
    let mut mounts: Vec<Mount> = spec
        .mounts_mut()
        .take()
        .unwrap_or_default()
        .into_iter()
        .filter(|m| m.destination() != Path::new("/dev"))
        .collect();

    mounts.push(
        MountBuilder::default()
            .destination("/dev")
            .typ("tmpfs")
            .source("tmpfs")
            .options(vec![
                "rw".to_string(),
                "nosuid".to_string(),
                "noexec".to_string(),
                "mode=755".to_string(),
                "size=65536k".to_string(),
            ])
            .build()
            .context("build /dev tmpfs mount")?,
    );

    if let Some(devices) = spec.linux().as_ref().and_then(|l| l.devices().as_ref()) {
        for device in devices {
            mounts.push(
                MountBuilder::default()
                    .destination(device.path().clone())
                    .typ("none")
                    .source(device.path().clone())
                    .options(vec!["bind".to_string(), "create=file".to_string()])
                    .build()
                    .with_context(|| {
                        format!("build bind mount for device {}", device.path().display())
                    })?,
            );
        }
    }

    *spec.mounts_mut() = Some(mounts);
    Ok(())
}

fn process_owner(spec: &Spec) -> (u32, u32) {
    spec.process()
        .as_ref()
        .map(|p| (p.user().uid(), p.user().gid()))
        .unwrap_or((0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci_spec::{
        LinuxBuilder, ProcessBuilder, SpecBuilder, UserBuilder,
    };
    use anyhow::Result;

    fn spec_with_user(uid: u32, gid: u32) -> Result<Spec> {
        Ok(SpecBuilder::default()
            .process(
                ProcessBuilder::default()
                    .user(UserBuilder::default().uid(uid).gid(gid).build()?)
                    .build()?,
            )
            .build()?)
    }

    #[test]
    fn default_devices_are_added_once() -> Result<()> {
        let mut spec = spec_with_user(1000, 1000)?;
        ensure_default_devices(&mut spec)?;

        let devices = spec.linux().as_ref().unwrap().devices().as_ref().unwrap();
        assert_eq!(devices.len(), DEFAULT_DEVICES.len());
        let null = devices
            .iter()
            .find(|d| d.path() == Path::new("/dev/null"))
            .unwrap();
        assert_eq!(null.uid(), Some(1000));
        assert_eq!(null.file_mode(), Some(0o666));
        Ok(())
    }

    #[test]
    fn existing_device_is_preserved() -> Result<()> {
        let mut spec = SpecBuilder::default()
            .linux(
                LinuxBuilder::default()
                    .devices(vec![LinuxDeviceBuilder::default()
                        .path("/dev/null")
                        .typ("c")
                        .major(1i64)
                        .minor(3i64)
                        .file_mode(0o600u32)
                        .build()?])
                    .build()?,
            )
            .build()?;
        ensure_default_devices(&mut spec)?;

        let devices = spec.linux().as_ref().unwrap().devices().as_ref().unwrap();
        assert_eq!(devices.len(), DEFAULT_DEVICES.len());
        let null = devices
            .iter()
            .find(|d| d.path() == Path::new("/dev/null"))
            .unwrap();
        assert_eq!(null.file_mode(), Some(0o600));
        Ok(())
    }

    #[test]
    fn cgroup_items_deny_first() -> Result<()> {
        let mut spec = spec_with_user(0, 0)?;
        ensure_default_devices(&mut spec)?;

        let items = cgroup_items(&spec);
        assert_eq!(items[0].key(), "cgroup2.devices.deny");
        assert_eq!(items[0].value(), "a");
        assert!(items
            .iter()
            .any(|i| i.key() == "cgroup2.devices.allow" && i.value() == "c 5:2 rwm"));
        assert!(items
            .iter()
            .any(|i| i.key() == "cgroup2.devices.allow" && i.value() == "c 136:* rwm"));
        assert!(items
            .iter()
            .any(|i| i.key() == "cgroup2.devices.allow" && i.value() == "c 1:3 rwm"));
        Ok(())
    }

    #[test]
    fn device_list_format() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("devices.txt");

        let mut spec = spec_with_user(1000, 1000)?;
        ensure_default_devices(&mut spec)?;
        write_device_list(&spec, &path)?;

        let content = fs::read_to_string(&path)?;
        assert!(content.contains("/dev/null c 1 3 666 1000:1000\n"));
        assert_eq!(content.lines().count(), DEFAULT_DEVICES.len());
        Ok(())
    }

    #[test]
    fn fallback_replaces_dev_mounts() -> Result<()> {
        let mut spec = SpecBuilder::default()
            .mounts(vec![
                MountBuilder::default()
                    .destination("/dev")
                    .typ("tmpfs")
                    .source("tmpfs")
                    .build()?,
                MountBuilder::default()
                    .destination("/proc")
                    .typ("proc")
                    .source("proc")
                    .build()?,
            ])
            .build()?;
        ensure_default_devices(&mut spec)?;
        bind_mount_fallback(&mut spec)?;

        let mounts = spec.mounts().as_ref().unwrap();
        // /proc survives, one fresh /dev tmpfs, one bind mount per device.
        assert_eq!(mounts.len(), 2 + DEFAULT_DEVICES.len());
        let dev_mounts: Vec<&Mount> = mounts
            .iter()
            .filter(|m| m.destination() == Path::new("/dev"))
            .collect();
        assert_eq!(dev_mounts.len(), 1);
        assert_eq!(dev_mounts[0].typ(), &Some("tmpfs".to_string()));

        let binds: Vec<&Mount> = mounts
            .iter()
            .filter(|m| {
                m.options()
                    .as_ref()
                    .map_or(false, |o| o.contains(&"bind".to_string()))
            })
            .collect();
        assert_eq!(binds.len(), DEFAULT_DEVICES.len());
        Ok(())
    }
}
