//! 分析通道（Analysis Channel）
//!
//! 与常驻的分析子进程之间的双向字节流，协议为按行的请求/应答：
//!
//! - 请求：命令字面量 + `\n`，写入后立即 flush
//! - 应答：每个请求一行 JSON
//!
//! 子进程的 stdout 设置为非阻塞，读取由上层的就绪等待驱动；`try_read_line` 只返回
//! 已经完整缓冲的一行，不完整的尾部留在缓冲区里等下一次可读。
//! 子进程的 stderr 直接继承（分析进程的调试日志写在那里）。

use std::ffi::OsStr;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::string::FromUtf8Error;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use blackbox_protocol::ProtocolError;

/// 单次 `read` 的块大小
const READ_CHUNK: usize = 2048;

/// 关闭管道后等待子进程自行退出的时间，超时则 kill
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// 分析通道错误类型
#[derive(Error, Debug)]
pub enum ChannelError {
    /// 无法确定当前可执行文件路径
    #[error("Failed to resolve executable path: {0}")]
    ExecutablePath(#[source] io::Error),

    /// 解析出的分析脚本不存在
    #[error("Worker script not found: {}", path.display())]
    WorkerNotFound { path: PathBuf },

    /// 启动子进程失败
    #[error("Failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// 写请求失败（包括子进程已退出导致的 EPIPE）
    #[error("Failed to write request to worker: {0}")]
    Write(#[source] io::Error),

    /// 读应答失败
    #[error("Failed to read from worker: {0}")]
    Read(#[source] io::Error),

    /// 子进程关闭了 stdout
    #[error("Worker closed its output (exited)")]
    WorkerExited,

    /// 单行超过上限，该行被丢弃
    #[error("Analysis line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    /// 该行不是合法 UTF-8
    #[error("Analysis line is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),

    /// 该行不是合法的分析结果
    #[error(transparent)]
    Malformed(#[from] ProtocolError),

    /// 通道已关闭
    #[error("Analysis channel closed")]
    Closed,
}

impl ChannelError {
    /// 单行级别的错误：记录日志、丢弃该行，周期保持 AwaitingBoth
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ChannelError::LineTooLong { .. }
                | ChannelError::InvalidUtf8(_)
                | ChannelError::Malformed(_)
        )
    }
}

/// 分析链路接口
///
/// 控制器只通过这个接口与分析进程交互，测试中可以替换为脚本化的实现。
pub trait AnalysisLink {
    /// 发送一条请求（自动追加换行并 flush）
    fn send_request(&mut self, command: &str) -> Result<(), ChannelError>;

    /// 非阻塞读取一行
    ///
    /// # 返回值
    /// - `Ok(Some(line))`: 一行完整应答（不含行尾）
    /// - `Ok(None)`: 当前没有完整的行
    /// - `Err(_)`: 可恢复的单行错误，或子进程退出等致命错误
    fn try_read_line(&mut self) -> Result<Option<String>, ChannelError>;

    /// 关闭两端管道并等待子进程退出；幂等
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// 分析进程的定位方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLocator {
    /// 解释器；`None` 时直接执行脚本
    pub interpreter: Option<String>,
    pub script: PathBuf,
    /// 从可执行文件所在目录向上的级数
    pub levels_up: usize,
}

impl WorkerLocator {
    /// 相对于当前可执行文件（解析符号链接后）定位脚本，不依赖工作目录
    pub fn resolve(&self) -> Result<PathBuf, ChannelError> {
        let exe = std::env::current_exe()
            .and_then(|p| p.canonicalize())
            .map_err(ChannelError::ExecutablePath)?;
        self.resolve_from(&exe)
    }

    /// 相对于给定的可执行文件路径定位脚本
    pub fn resolve_from(&self, exe: &Path) -> Result<PathBuf, ChannelError> {
        let mut base = exe.parent().unwrap_or(exe);
        for _ in 0..self.levels_up {
            base = base.parent().unwrap_or(base);
        }

        // 绝对路径的 script 会替换 base
        let path = base.join(&self.script);
        if !path.is_file() {
            return Err(ChannelError::WorkerNotFound { path });
        }
        Ok(path)
    }

    fn command(&self, script: &Path) -> Command {
        match &self.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(script);
                cmd
            },
            None => Command::new(script),
        }
    }
}

/// 按行切分的读缓冲
///
/// 超长的行报告一次 `LineTooLong`，然后丢弃到下一个换行符为止。
#[derive(Debug)]
struct LineBuffer {
    buf: Vec<u8>,
    max_line_bytes: usize,
    discarding: bool,
}

impl LineBuffer {
    fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_line_bytes),
            max_line_bytes,
            discarding: false,
        }
    }

    fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }

    /// 取出下一行；没有完整的行时返回 `None`
    fn next_line(&mut self) -> Option<Result<String, ChannelError>> {
        loop {
            let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
                if !self.discarding && self.buf.len() >= self.max_line_bytes {
                    self.buf.clear();
                    self.discarding = true;
                    return Some(Err(ChannelError::LineTooLong {
                        limit: self.max_line_bytes,
                    }));
                }
                if self.discarding {
                    self.buf.clear();
                }
                return None;
            };

            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            if std::mem::take(&mut self.discarding) {
                // 超长行的尾部
                continue;
            }
            if line.len() > self.max_line_bytes {
                return Some(Err(ChannelError::LineTooLong {
                    limit: self.max_line_bytes,
                }));
            }

            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(String::from_utf8(line).map_err(ChannelError::from));
        }
    }
}

/// 与分析子进程的通道
#[derive(Debug)]
pub struct AnalysisChannel {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    lines: LineBuffer,
    eof: bool,
    exit_status: Option<ExitStatus>,
    closed: bool,
    program: String,
}

impl AnalysisChannel {
    /// 按 `WorkerLocator` 定位脚本并启动
    ///
    /// # 错误
    /// - `ChannelError::ExecutablePath` / `WorkerNotFound`: 无法定位脚本
    /// - `ChannelError::Spawn`: 启动失败
    pub fn open(locator: &WorkerLocator, max_line_bytes: usize) -> Result<Self, ChannelError> {
        let script = locator.resolve()?;
        info!("Starting analysis worker: {}", script.display());
        Self::spawn(locator.command(&script), max_line_bytes)
    }

    /// 以给定命令启动子进程，stdin/stdout 接管道，stderr 继承
    pub fn spawn(mut command: Command, max_line_bytes: usize) -> Result<Self, ChannelError> {
        let program = describe(command.get_program(), command.get_args());
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let spawn_err = |source: io::Error| ChannelError::Spawn {
            program: program.clone(),
            source,
        };

        let mut child = command.spawn().map_err(spawn_err)?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(spawn_err(io::Error::other("child pipes unavailable")));
        };

        if let Err(e) = set_nonblocking(&stdout) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(spawn_err(e));
        }

        debug!("Analysis worker '{}' spawned (pid {})", program, child.id());
        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: Some(stdout),
            lines: LineBuffer::new(max_line_bytes),
            eof: false,
            exit_status: None,
            closed: false,
            program,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// 子进程的退出状态（`close` 之后可用）
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// 供 poll 使用的文件描述符（子进程 stdout）；关闭后返回 `None`
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        self.stdout.as_ref().map(|s| s.as_fd())
    }

    fn wait_for_exit(&mut self) {
        let deadline = Instant::now() + EXIT_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    self.exit_status = Some(status);
                    break;
                },
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10));
                },
                Ok(None) => {
                    warn!(
                        "Analysis worker (pid {}) did not exit within {:?}, killing it",
                        self.child.id(),
                        EXIT_GRACE
                    );
                    let _ = self.child.kill();
                    self.exit_status = self.child.wait().ok();
                    break;
                },
                Err(e) => {
                    warn!("Failed to wait for analysis worker: {}", e);
                    break;
                },
            }
        }

        match self.exit_status {
            Some(status) => info!("Analysis worker exited: {}", status),
            None => warn!("Analysis worker exit status unknown"),
        }
    }
}

impl AnalysisLink for AnalysisChannel {
    fn send_request(&mut self, command: &str) -> Result<(), ChannelError> {
        let stdin = self.stdin.as_mut().ok_or(ChannelError::Closed)?;

        let mut request = Vec::with_capacity(command.len() + 1);
        request.extend_from_slice(command.as_bytes());
        request.push(b'\n');

        stdin.write_all(&request).map_err(ChannelError::Write)?;
        stdin.flush().map_err(ChannelError::Write)?;
        trace!("Sent request to analysis worker: {}", command);
        Ok(())
    }

    fn try_read_line(&mut self) -> Result<Option<String>, ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }

        loop {
            if let Some(line) = self.lines.next_line() {
                return line.map(Some);
            }
            if self.eof {
                if self.lines.has_pending() {
                    debug!("Discarding unterminated tail from analysis worker");
                }
                return Err(ChannelError::WorkerExited);
            }

            let stdout = self.stdout.as_mut().ok_or(ChannelError::Closed)?;
            let mut chunk = [0u8; READ_CHUNK];
            match stdout.read(&mut chunk) {
                Ok(0) => self.eof = true,
                Ok(n) => self.lines.extend(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ChannelError::Read(e)),
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        // 关闭 stdin 让子进程读到 EOF
        drop(self.stdin.take());
        drop(self.stdout.take());
        self.wait_for_exit();
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for AnalysisChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn set_nonblocking(stdout: &ChildStdout) -> io::Result<()> {
    let fd = stdout.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn describe<'a>(program: &OsStr, args: impl Iterator<Item = &'a OsStr>) -> String {
    let mut out = program.to_string_lossy().into_owned();
    for arg in args {
        out.push(' ');
        out.push_str(&arg.to_string_lossy());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(buf: &mut LineBuffer) -> Vec<Result<String, String>> {
        let mut out = Vec::new();
        while let Some(line) = buf.next_line() {
            out.push(line.map_err(|e| e.to_string()));
        }
        out
    }

    #[test]
    fn test_line_buffer_splits_lines() {
        let mut buf = LineBuffer::new(64);
        buf.extend(b"{\"a\":1}\n{\"b\"");
        assert_eq!(drain(&mut buf), vec![Ok("{\"a\":1}".to_string())]);
        assert!(buf.has_pending());

        buf.extend(b":2}\r\n");
        assert_eq!(drain(&mut buf), vec![Ok("{\"b\":2}".to_string())]);
        assert!(!buf.has_pending());
    }

    #[test]
    fn test_line_buffer_skips_blank_lines() {
        let mut buf = LineBuffer::new(64);
        buf.extend(b"\n  \r\nx\n");
        assert_eq!(drain(&mut buf), vec![Ok("x".to_string())]);
    }

    #[test]
    fn test_line_buffer_oversized_line_reported_once() {
        let mut buf = LineBuffer::new(8);
        buf.extend(b"0123456789");
        let first = drain(&mut buf);
        assert_eq!(first.len(), 1);
        assert!(first[0].as_ref().unwrap_err().contains("exceeds 8 bytes"));

        // 仍在丢弃超长行的剩余部分
        buf.extend(b"abcdef");
        assert!(drain(&mut buf).is_empty());

        buf.extend(b"gh\nok\n");
        assert_eq!(drain(&mut buf), vec![Ok("ok".to_string())]);
    }

    #[test]
    fn test_line_buffer_complete_oversized_line() {
        let mut buf = LineBuffer::new(4);
        buf.extend(b"12345\nab\n");
        let lines = drain(&mut buf);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].is_err());
        assert_eq!(lines[1], Ok("ab".to_string()));
    }

    #[test]
    fn test_line_buffer_invalid_utf8() {
        let mut buf = LineBuffer::new(64);
        buf.extend(b"\xff\xfe\n");
        let mut lines = Vec::new();
        while let Some(line) = buf.next_line() {
            lines.push(line);
        }
        assert!(matches!(lines.as_slice(), [Err(ChannelError::InvalidUtf8(_))]));
    }

    #[test]
    fn test_error_classification() {
        assert!(ChannelError::LineTooLong { limit: 2048 }.is_recoverable());
        assert!(
            ChannelError::Malformed(ProtocolError::NotAnObject { kind: "array" }).is_recoverable()
        );
        assert!(!ChannelError::WorkerExited.is_recoverable());
        assert!(!ChannelError::Closed.is_recoverable());
        assert!(
            !ChannelError::Write(io::Error::from(io::ErrorKind::BrokenPipe)).is_recoverable()
        );
    }

    #[test]
    fn test_resolve_from_walks_up_from_executable_dir() {
        let root = tempfile::tempdir().unwrap();
        let bin_dir = root.path().join("build").join("bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        let ai_dir = root.path().join("ai");
        std::fs::create_dir_all(&ai_dir).unwrap();
        std::fs::write(ai_dir.join("vision_server.py"), "").unwrap();

        let locator = WorkerLocator {
            interpreter: Some("python3".into()),
            script: PathBuf::from("ai/vision_server.py"),
            levels_up: 2,
        };
        let resolved = locator.resolve_from(&bin_dir.join("blackbox")).unwrap();
        assert_eq!(resolved, ai_dir.join("vision_server.py"));
    }

    #[test]
    fn test_resolve_from_missing_script() {
        let root = tempfile::tempdir().unwrap();
        let locator = WorkerLocator {
            interpreter: None,
            script: PathBuf::from("ai/missing.py"),
            levels_up: 0,
        };
        let err = locator.resolve_from(&root.path().join("blackbox")).unwrap_err();
        match err {
            ChannelError::WorkerNotFound { path } => {
                assert_eq!(path, root.path().join("ai/missing.py"))
            },
            other => panic!("Expected WorkerNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_describe_command() {
        let mut cmd = Command::new("python3");
        cmd.arg("ai/vision_server.py");
        assert_eq!(
            describe(cmd.get_program(), cmd.get_args()),
            "python3 ai/vision_server.py"
        );
    }
}
