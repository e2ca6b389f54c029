use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::Command,
};

use log::{debug, error, log_enabled, Level};

/// Runs the external tools the build relies on
pub(crate) trait CommandRunner {
    fn find_binary(&self, name: &str) -> Option<PathBuf>;

    /// Runs the program to completion, returning whether it succeeded
    fn run(&mut self, program: &Path, args: &[OsString]) -> Result<bool, io::Error>;

    /// Runs the program and returns its standard output, if it succeeded
    fn output(&mut self, program: &Path, args: &[OsString]) -> Result<Option<String>, io::Error>;
}

fn command_line(program: &Path, args: &[OsString]) -> String {
    let mut line = program.display().to_string();

    for arg in args {
        line.push(' ');
        line.push_str(&arg.to_string_lossy());
    }

    line
}

#[derive(Debug, Default)]
pub(crate) struct HostRunner;

impl CommandRunner for HostRunner {
    fn find_binary(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }

    fn run(&mut self, program: &Path, args: &[OsString]) -> Result<bool, io::Error> {
        if log_enabled!(Level::Debug) {
            debug!("Running {}", command_line(program, args));
        }

        let output = Command::new(program).args(args).output()?;

        if !output.status.success() {
            error!(
                "{} failed ({}): {}",
                program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(output.status.success())
    }

    fn output(&mut self, program: &Path, args: &[OsString]) -> Result<Option<String>, io::Error> {
        if log_enabled!(Level::Debug) {
            debug!("Running {}", command_line(program, args));
        }

        let output = Command::new(program).args(args).output()?;

        if !output.status.success() {
            debug!("{} exited with {}", program.display(), output.status);
            return Ok(None);
        }

        Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_owned()))
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use std::{
        collections::BTreeMap,
        ffi::OsString,
        io,
        path::{Path, PathBuf},
    };

    use crate::runner::CommandRunner;

    /// Records the commands instead of running them
    #[derive(Debug, Default)]
    pub(crate) struct RecordingRunner {
        pub(crate) calls: Vec<Vec<String>>,
        pub(crate) failing: Vec<String>,
        pub(crate) missing: Vec<String>,
        pub(crate) outputs: BTreeMap<String, String>,
    }

    impl RecordingRunner {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn programs(&self) -> Vec<&str> {
            self.calls.iter().map(|c| c[0].as_str()).collect()
        }
    }

    impl CommandRunner for RecordingRunner {
        fn find_binary(&self, name: &str) -> Option<PathBuf> {
            if self.missing.iter().any(|m| m == name) {
                None
            } else {
                Some(Path::new("/usr/bin").join(name))
            }
        }

        fn run(&mut self, program: &Path, args: &[OsString]) -> Result<bool, io::Error> {
            let name = program
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let mut call = vec![name.clone()];
            call.extend(args.iter().map(|a| a.to_string_lossy().into_owned()));
            self.calls.push(call);

            Ok(!self.failing.contains(&name))
        }

        fn output(
            &mut self,
            program: &Path,
            args: &[OsString],
        ) -> Result<Option<String>, io::Error> {
            if !self.run(program, args)? {
                return Ok(None);
            }

            // Outputs are looked up by full command line, then by program name
            let call = self.calls.last().cloned().unwrap_or_default();
            let output = self
                .outputs
                .get(&call.join(" "))
                .or_else(|| call.first().and_then(|name| self.outputs.get(name)))
                .cloned()
                .unwrap_or_default();

            Ok(Some(output))
        }
    }
}
