//! HotSpot dynamic attach over the Linux attach socket.
//!
//! A HotSpot JVM starts its attach listener when it receives `SIGQUIT` while
//! an `.attach_pid<nspid>` file exists in its working directory (or `/tmp`).
//! The listener is a Unix socket at `/tmp/.java_pid<nspid>` inside the
//! target's mount namespace, reached through `/proc/<pid>/root`.
//!
//! Each command uses a fresh connection:
//!
//! ```text
//! request:  1 \0 <command> \0 <arg1> \0 <arg2> \0 <arg3> \0
//! response: <status>\n<output...>
//! ```
//!
//! All functions here block; async callers go through `spawn_blocking`.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use procfs::process::Process;
use tracing::{debug, info};

use crate::error::{AttachError, Result};
use crate::scoring::Properties;

// ============================================================================
// Constants
// ============================================================================

/// How long to wait for the attach listener to appear.
pub const DEFAULT_ATTACH_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

const PROTOCOL_VERSION: &str = "1";

/// The attach protocol always carries exactly this many arguments.
const ARG_COUNT: usize = 3;

// ============================================================================
// Virtual Machine
// ============================================================================

/// An attached JVM.
#[derive(Debug)]
pub struct VirtualMachine {
    pid: u32,
    socket: PathBuf,
    /// Trigger file we created, removed on detach.
    attach_file: Option<PathBuf>,
}

impl VirtualMachine {
    pub fn attach(pid: u32) -> Result<Self> {
        Self::attach_with_timeout(pid, DEFAULT_ATTACH_TIMEOUT)
    }

    /// Attaches, starting the target's attach listener if needed.
    pub fn attach_with_timeout(pid: u32, timeout: Duration) -> Result<Self> {
        let ns_pid = namespace_pid(pid)?;
        let socket = target_tmp(pid).join(format!(".java_pid{ns_pid}"));

        let attach_file = if socket.exists() {
            None
        } else {
            Some(start_attach_listener(pid, ns_pid, &socket, timeout)?)
        };

        debug!(pid, socket = %socket.display(), "Attached to JVM");
        Ok(Self {
            pid,
            socket,
            attach_file,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Runs one attach command and returns its output after the status line.
    pub fn execute(&self, command: &str, args: &[&str]) -> Result<String> {
        if args.len() > ARG_COUNT {
            return Err(AttachError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("attach commands take at most {ARG_COUNT} arguments"),
            )));
        }

        let mut stream = UnixStream::connect(&self.socket)?;
        stream.write_all(&encode_command(command, args))?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw)?;
        let response = String::from_utf8_lossy(&raw);

        let (status_line, output) = response.split_once('\n').unwrap_or((&response, ""));
        let status = status_line
            .trim()
            .parse::<i32>()
            .map_err(|_| AttachError::Command {
                command: command.to_string(),
                status: -1,
                output: response.trim().to_string(),
            })?;

        if status != 0 {
            return Err(AttachError::Command {
                command: command.to_string(),
                status,
                output: output.trim().to_string(),
            });
        }
        Ok(output.to_string())
    }

    /// Reads the target's system properties.
    pub fn properties(&self) -> Result<Properties> {
        let text = self.execute("properties", &[])?;
        Ok(parse_properties(&text))
    }

    /// Loads a Java agent JAR, passing `options` to its `agentmain`.
    pub fn load_agent(&self, jar: &Path, options: &str) -> Result<()> {
        let arg = format!("{}={options}", jar.display());
        let output = self.execute("load", &["instrument", "false", &arg])?;
        check_agent_return(self.pid, &output)?;
        info!(pid = self.pid, jar = %jar.display(), "Agent loaded");
        Ok(())
    }

    /// Releases attach resources held on our side.
    pub fn detach(mut self) -> Result<()> {
        if let Some(file) = self.attach_file.take() {
            match fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(pid = self.pid, "Detached from JVM");
        Ok(())
    }
}

// ============================================================================
// Attach Listener Startup
// ============================================================================

fn target_tmp(pid: u32) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/root/tmp"))
}

/// Pid of the target inside its own pid namespace.
fn namespace_pid(pid: u32) -> Result<u32> {
    let procfs_error = |e: procfs::ProcError| AttachError::Procfs {
        pid,
        message: e.to_string(),
    };
    let process = Process::new(pid as i32).map_err(procfs_error)?;
    let status = process.status().map_err(procfs_error)?;

    Ok(status
        .nspid
        .and_then(|ids| ids.last().copied())
        .and_then(|id| u32::try_from(id).ok())
        .unwrap_or(pid))
}

/// Creates the trigger file, signals the target and waits for the socket.
fn start_attach_listener(
    pid: u32,
    ns_pid: u32,
    socket: &Path,
    timeout: Duration,
) -> Result<PathBuf> {
    let attach_file = create_attach_file(pid, ns_pid)?;

    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGQUIT) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        let _ = fs::remove_file(&attach_file);
        return Err(err.into());
    }

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if socket.exists() {
            return Ok(attach_file);
        }
        thread::sleep(POLL_INTERVAL);
    }

    let _ = fs::remove_file(&attach_file);
    Err(AttachError::SocketTimeout { pid, timeout })
}

fn create_attach_file(pid: u32, ns_pid: u32) -> Result<PathBuf> {
    let name = format!(".attach_pid{ns_pid}");
    let in_cwd = PathBuf::from(format!("/proc/{pid}/cwd")).join(&name);

    match File::create(&in_cwd) {
        Ok(_) => Ok(in_cwd),
        Err(e) => {
            debug!(pid, error = %e, "Cannot create attach file in target cwd, using /tmp");
            let in_tmp = target_tmp(pid).join(&name);
            File::create(&in_tmp)?;
            Ok(in_tmp)
        }
    }
}

// ============================================================================
// Wire Helpers
// ============================================================================

fn encode_command(command: &str, args: &[&str]) -> Vec<u8> {
    let mut request = Vec::new();
    for part in [PROTOCOL_VERSION, command] {
        request.extend_from_slice(part.as_bytes());
        request.push(0);
    }
    for i in 0..ARG_COUNT {
        request.extend_from_slice(args.get(i).copied().unwrap_or_default().as_bytes());
        request.push(0);
    }
    request
}

/// Interprets the agent's return code printed after a successful `load`.
///
/// Newer JVMs print `return code: <n>`, older ones just `<n>`.
fn check_agent_return(pid: u32, output: &str) -> Result<()> {
    let first = output.lines().next().unwrap_or_default().trim();
    let code = first
        .strip_prefix("return code:")
        .map(str::trim)
        .unwrap_or(first);

    match code.parse::<i32>() {
        Ok(0) => Ok(()),
        _ if code.is_empty() => Ok(()),
        Ok(n) => Err(AttachError::AgentLoad {
            pid,
            message: format!("agent returned {n}: {}", output.trim()),
        }),
        Err(_) => Err(AttachError::AgentLoad {
            pid,
            message: output.trim().to_string(),
        }),
    }
}

// ============================================================================
// Properties Text
// ============================================================================

/// Parses `java.util.Properties` text as written by `Properties.store`.
pub fn parse_properties(text: &str) -> Properties {
    let mut properties = Properties::new();
    let mut logical = String::new();

    for line in text.lines() {
        let line = line.trim_start();
        if logical.is_empty()
            && (line.is_empty() || line.starts_with('#') || line.starts_with('!'))
        {
            continue;
        }
        if let Some(head) = continued(line) {
            logical.push_str(head);
            continue;
        }
        logical.push_str(line);
        insert_entry(&mut properties, &logical);
        logical.clear();
    }
    if !logical.is_empty() {
        insert_entry(&mut properties, &logical);
    }
    properties
}

/// The line without its continuation backslash, if it has one.
fn continued(line: &str) -> Option<&str> {
    let trailing = line.chars().rev().take_while(|c| *c == '\\').count();
    (trailing % 2 == 1).then(|| &line[..line.len() - 1])
}

fn insert_entry(properties: &mut Properties, entry: &str) {
    let (key, value) = split_entry(entry);
    properties.insert(unescape(key), unescape(value));
}

/// Splits at the first unescaped `=`, `:` or whitespace.
fn split_entry(entry: &str) -> (&str, &str) {
    let mut escaped = false;
    for (i, c) in entry.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' | ':' => {
                let (key, rest) = entry.split_at(i);
                return (key, rest[1..].trim_start());
            }
            c if c.is_whitespace() => {
                let (key, rest) = entry.split_at(i);
                let rest = rest.trim_start();
                let rest = rest
                    .strip_prefix(['=', ':'])
                    .unwrap_or(rest)
                    .trim_start();
                return (key, rest);
            }
            _ => {}
        }
    }
    (entry, "")
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('f') => out.push('\u{000C}'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                let decoded = u32::from_str_radix(&hex, 16)
                    .ok()
                    .and_then(char::from_u32);
                out.push(decoded.unwrap_or(char::REPLACEMENT_CHARACTER));
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command_pads_arguments() {
        assert_eq!(encode_command("properties", &[]), b"1\0properties\0\0\0\0".to_vec());
        assert_eq!(
            encode_command("load", &["instrument", "false", "/a.jar=port=5557"]),
            b"1\0load\0instrument\0false\0/a.jar=port=5557\0".to_vec()
        );
    }

    #[test]
    fn test_parse_properties_store_output() {
        let text = "#Thu Oct 16 10:00:00 UTC 2026\n\
                    java.version=21.0.4\n\
                    sun.java.command=org.springframework.boot.loader.launch.JarLauncher --server.port\\=8080\n\
                    file.separator=/\n\
                    line.separator=\\n\n\
                    spring.application.name = orders\n";

        let properties = parse_properties(text);

        assert_eq!(properties.get("java.version").map(String::as_str), Some("21.0.4"));
        assert_eq!(
            properties.get("sun.java.command").map(String::as_str),
            Some("org.springframework.boot.loader.launch.JarLauncher --server.port=8080")
        );
        assert_eq!(properties.get("line.separator").map(String::as_str), Some("\n"));
        assert_eq!(
            properties.get("spring.application.name").map(String::as_str),
            Some("orders")
        );
        assert_eq!(properties.len(), 5);
    }

    #[test]
    fn test_parse_properties_escapes_and_continuations() {
        let text = "user.dir=C\\:\\\\work\\\\app\n\
                    key\\ with\\ spaces:value\n\
                    greeting=\\u00e9t\\u00e9\n\
                    path.list=/a:\\\n    /b\n\
                    ! comment\n\
                    empty\n";

        let properties = parse_properties(text);

        assert_eq!(properties["user.dir"], "C:\\work\\app");
        assert_eq!(properties["key with spaces"], "value");
        assert_eq!(properties["greeting"], "été");
        assert_eq!(properties["path.list"], "/a:/b");
        assert_eq!(properties["empty"], "");
    }

    #[test]
    fn test_agent_return_codes() {
        assert!(check_agent_return(1, "0\n").is_ok());
        assert!(check_agent_return(1, "return code: 0\n").is_ok());
        assert!(check_agent_return(1, "").is_ok());

        let err = check_agent_return(7, "return code: 102\n").unwrap_err();
        assert!(matches!(err, AttachError::AgentLoad { pid: 7, .. }));

        let err = check_agent_return(7, "java.lang.ClassNotFoundException: Agent").unwrap_err();
        assert!(err.to_string().contains("ClassNotFoundException"));
    }

    #[test]
    fn test_attach_to_missing_process_is_procfs_error() {
        // pid_max on Linux never reaches this value
        let err = VirtualMachine::attach_with_timeout(u32::MAX / 2, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, AttachError::Procfs { .. }));
    }
}
