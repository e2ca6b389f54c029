use std::{
    io,
    os::unix::process::CommandExt as _,
    path::Path,
    process::Command,
};

use log::{debug, warn};
use nix::unistd::{chdir, chroot};

const XORG_PATH: &str = "usr/bin/Xorg";

/// Runs a single command chrooted into `root`
///
/// Only the child process is confined, ours keeps its root and working
/// directory.
pub(crate) fn run_in_chroot(root: &Path, program: &str, args: &[&str]) -> Result<bool, io::Error> {
    debug!(
        "Running {program} {} in {}",
        args.join(" "),
        root.display()
    );

    let root = root.to_path_buf();
    let mut command = Command::new(program);
    command.args(args);

    // SAFETY: The closure runs in the forked child before exec and only calls
    // chroot(2) and chdir(2).
    unsafe {
        command.pre_exec(move || {
            chroot(root.as_path())?;
            chdir("/")?;
            Ok(())
        });
    }

    Ok(command.status()?.success())
}

/// Makes the X server setuid root, if the image ships one
pub(crate) fn setuid_xorg(instroot: &Path) -> Result<bool, io::Error> {
    if !instroot.join(XORG_PATH).exists() {
        debug!("No X server in {}", instroot.display());
        return Ok(false);
    }

    let success = run_in_chroot(instroot, "/bin/chmod", &["u+s", "/usr/bin/Xorg"])?;
    if !success {
        warn!("Couldn't set the setuid bit on /usr/bin/Xorg");
    }

    Ok(success)
}
