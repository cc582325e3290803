use std::io::Write;
use std::process::Stdio;

use anyhow::{Context, anyhow};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use super::{SourceFile, Transform};
use crate::error::TransformError;

/// Pipes every file through an external program: contents on stdin, result
/// on stdout. Used for the script transpiler/minifier and the optional CSS
/// prefixer.
pub struct Command {
    stage: String,
    argv: Vec<String>,
}

impl Command {
    pub fn new(stage: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            stage: stage.into(),
            argv,
        }
    }

    fn run(&self, file: SourceFile) -> anyhow::Result<SourceFile> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("no command configured"))?;

        let mut child = std::process::Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("couldn't start `{program}`"))?;

        let mut stdin = child.stdin.take().context("stdin was not captured")?;
        let data = file.data;

        // Feed stdin from another thread so a large output can't fill the
        // stdout pipe while we are still writing.
        let (output, written) = std::thread::scope(|s| {
            let writer = s.spawn(move || stdin.write_all(&data));
            let output = child.wait_with_output();
            (output, writer.join())
        });

        let output = output.with_context(|| format!("`{program}` failed on {}", file.path))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "`{program}` exited with {} on {}\n{}",
                output.status,
                file.path,
                stderr.trim_end()
            ));
        }

        match written {
            Ok(Ok(())) => {}
            // The program finished without reading all of its input.
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => return Err(e).with_context(|| format!("couldn't write {} to `{program}`", file.path)),
            Err(_) => return Err(anyhow!("stdin writer for `{program}` panicked")),
        }

        Ok(SourceFile::new(file.path, output.stdout))
    }
}

impl Transform for Command {
    fn stage(&self) -> &str {
        &self.stage
    }

    fn apply(&self, files: Vec<SourceFile>) -> Result<Vec<SourceFile>, TransformError> {
        files
            .into_par_iter()
            .map(|file| self.run(file))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(|cause| TransformError::new(self.stage.clone(), cause))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn pipes_contents_through_the_program() {
        let upper = Command::new("upper", argv(&["tr", "a-z", "A-Z"]));
        let out = upper
            .apply(vec![
                SourceFile::new("a.js", "console.log(1)"),
                SourceFile::new("b.js", "alert(2)"),
            ])
            .unwrap();

        assert_eq!(
            out,
            vec![
                SourceFile::new("a.js", "CONSOLE.LOG(1)"),
                SourceFile::new("b.js", "ALERT(2)"),
            ]
        );
    }

    #[test]
    fn non_zero_exit_is_a_transform_error() {
        let failing = Command::new("js", argv(&["sh", "-c", "echo nope >&2; exit 3"]));
        let err = failing
            .apply(vec![SourceFile::new("app.js", "x")])
            .unwrap_err();

        assert_eq!(err.stage, "js");
        assert!(err.to_string().contains("nope"));
        assert!(err.to_string().contains("app.js"));
    }

    #[test]
    fn missing_program_is_a_transform_error() {
        let missing = Command::new("js", argv(&["tessen-no-such-program"]));
        let err = missing
            .apply(vec![SourceFile::new("app.js", "x")])
            .unwrap_err();

        assert!(err.to_string().contains("couldn't start"));
    }
}
