use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

/// How the replay binary is started.
#[derive(Debug, Clone, Default)]
pub enum Privilege {
    #[default]
    User,
    /// Through `sudo -k -S`, with the password written to stdin.
    Sudo { password: Option<String> },
}

/// A running replay process with piped output.
///
/// The process is killed if this is dropped while it is still running.
pub struct SupervisedChild {
    child: Child,
    pid: Option<u32>,
    privilege: Privilege,
    // Held open for the lifetime of the process, sudo reads the password from it.
    _stdin: Option<ChildStdin>,
    stdout: Option<OutputLines<ChildStdout>>,
}

impl SupervisedChild {
    pub async fn spawn(
        program: &Path,
        args: &[String],
        privilege: &Privilege,
    ) -> std::io::Result<Self> {
        let mut command = match privilege {
            Privilege::User => Command::new(program),
            Privilege::Sudo { .. } => {
                let mut command = Command::new("sudo");
                command.args(["-k", "-S"]).arg(program);
                command
            }
        };
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::debug!("Spawning {} {}", program.display(), args.join(" "));
        let mut child = command.spawn()?;
        let pid = child.id();

        let mut stdin = child.stdin.take();
        if let (Privilege::Sudo { password: Some(password) }, Some(stdin)) = (privilege, &mut stdin)
        {
            stdin.write_all(format!("{password}\n").as_bytes()).await?;
            stdin.flush().await?;
        }

        let stdout = child.stdout.take().map(OutputLines::new);

        Ok(Self {
            child,
            pid,
            privilege: privilege.clone(),
            _stdin: stdin,
            stdout,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the line reader for standard output, only available once.
    pub fn take_stdout(&mut self) -> Option<OutputLines<ChildStdout>> {
        self.stdout.take()
    }

    /// Take standard error, only available once.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Whether the process is still running.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask the process to stop.
    ///
    /// A process started through sudo is owned by root, so it is signalled with `sudo kill` using
    /// the same password.
    pub async fn terminate(&mut self) -> std::io::Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        match (&self.privilege, self.pid) {
            (Privilege::Sudo { password }, Some(pid)) => {
                let mut kill = Command::new("sudo")
                    .args(["-S", "kill", &pid.to_string()])
                    .stdin(Stdio::piped())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()?;
                if let (Some(password), Some(mut stdin)) = (password, kill.stdin.take()) {
                    stdin.write_all(format!("{password}\n").as_bytes()).await?;
                }
                let status = kill.wait().await?;
                if !status.success() {
                    log::warn!("sudo kill {pid} exited with {status}, killing sudo instead");
                    self.child.start_kill()?;
                }
                Ok(())
            }
            _ => self.child.start_kill(),
        }
    }

    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }
}

/// Reads output line by line, replacing invalid UTF-8 rather than failing.
pub struct OutputLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: tokio::io::AsyncRead + Unpin> OutputLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    /// The next line without its line ending, `None` at end of stream.
    ///
    /// Cancel safe, a partially read line is kept for the next call.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.buf).await?;
        if read == 0 && self.buf.is_empty() {
            return Ok(None);
        }

        let line = String::from_utf8_lossy(&self.buf)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        self.buf.clear();
        Ok(Some(line))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;

    fn sh() -> PathBuf {
        PathBuf::from("/bin/sh")
    }

    fn script(body: &str) -> Vec<String> {
        vec!["-c".to_string(), body.to_string()]
    }

    #[tokio::test]
    async fn reads_output_lines() {
        let mut child = SupervisedChild::spawn(
            &sh(),
            &script("printf 'one\\ntwo\\r\\nthree'; echo oops >&2"),
            &Privilege::User,
        )
        .await
        .expect("spawn");

        let mut stdout = child.take_stdout().expect("stdout");
        let mut lines = Vec::new();
        while let Some(line) = stdout.next_line().await.expect("read") {
            lines.push(line);
        }
        assert_eq!(lines, vec!["one", "two", "three"]);

        let mut stderr = OutputLines::new(child.take_stderr().expect("stderr"));
        assert_eq!(
            stderr.next_line().await.expect("read"),
            Some("oops".to_string())
        );
        assert!(child.wait().await.expect("wait").success());
    }

    #[tokio::test]
    async fn terminate_stops_a_running_process() {
        let mut child = SupervisedChild::spawn(&sh(), &script("sleep 30"), &Privilege::User)
            .await
            .expect("spawn");
        assert!(child.is_running());

        child.terminate().await.expect("terminate");
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("exits in time")
            .expect("wait");
        assert!(!status.success());
    }

    #[tokio::test]
    async fn terminate_after_exit_is_a_no_op() {
        let mut child = SupervisedChild::spawn(&sh(), &script("exit 0"), &Privilege::User)
            .await
            .expect("spawn");
        child.wait().await.expect("wait");

        child.terminate().await.expect("terminate");
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let mut child =
            SupervisedChild::spawn(&sh(), &script("printf 'a\\377b\\n'"), &Privilege::User)
                .await
                .expect("spawn");

        let mut stdout = child.take_stdout().expect("stdout");
        assert_eq!(
            stdout.next_line().await.expect("read"),
            Some("a\u{FFFD}b".to_string())
        );
    }
}
