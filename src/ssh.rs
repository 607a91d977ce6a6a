use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use ssh2::{ExtendedData, FileStat, OpenFlags, OpenType, Sftp};
use tracing::debug;

use crate::inventory::Target;
use crate::session::{CancelScope, Connector, Session, SessionError};
use crate::transfer::{self, RemoteFs};

/// libssh2 treats 0 as "no timeout"; never hand it that.
fn timeout_ms(remaining: Duration) -> u32 {
    u32::try_from(remaining.as_millis()).unwrap_or(u32::MAX).max(1)
}

/// Password-authenticated SSH via libssh2. Host keys are not checked.
#[derive(Debug, Default, Clone)]
pub struct SshConnector;

impl Connector for SshConnector {
    fn connect(
        &self,
        target: &Target,
        scope: &CancelScope,
    ) -> Result<Box<dyn Session>, SessionError> {
        let endpoint = target.endpoint();
        let tcp = connect_tcp(target, scope)?;

        // Shutting the socket down unblocks any libssh2 call stuck on it.
        let watchdog = tcp.try_clone().map_err(|e| SessionError::Connect {
            endpoint: endpoint.clone(),
            source: e,
        })?;
        scope.on_cancel(move || {
            let _ = watchdog.shutdown(Shutdown::Both);
        });

        let mut session =
            ssh2::Session::new().map_err(|e| SessionError::Session(e.to_string()))?;
        session.set_timeout(timeout_ms(scope.remaining()));
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| classify(scope, format!("ssh handshake with {endpoint}: {e}")))?;
        debug!(target = %endpoint, "ssh handshake complete");

        scope.check()?;
        session.set_timeout(timeout_ms(scope.remaining()));
        session
            .userauth_password(&target.user, &target.password)
            .map_err(|e| {
                if scope.is_expired() {
                    SessionError::Timeout(scope.timeout())
                } else {
                    SessionError::Auth {
                        user: target.user.clone(),
                        detail: e.to_string(),
                    }
                }
            })?;
        if !session.authenticated() {
            return Err(SessionError::Auth {
                user: target.user.clone(),
                detail: "server did not accept the password".into(),
            });
        }
        debug!(target = %endpoint, user = %target.user, "authenticated");

        Ok(Box::new(SshSession {
            session,
            scope: scope.clone(),
            closed: false,
        }))
    }
}

/// Name lookup can block well past any deadline, so it runs on its own
/// thread and is abandoned when the scope runs out.
fn resolve_addrs(target: &Target, scope: &CancelScope) -> Result<Vec<SocketAddr>, SessionError> {
    let host = target.address.clone();
    let port = target.port;
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("dns-{host}"))
        .spawn(move || {
            let res = (host.as_str(), port)
                .to_socket_addrs()
                .map(|addrs| addrs.collect::<Vec<_>>());
            let _ = tx.send(res);
        })
        .map_err(|e| SessionError::Session(format!("spawn resolver thread: {e}")))?;

    match rx.recv_timeout(scope.remaining()) {
        Ok(res) => res.map_err(|e| SessionError::Connect {
            endpoint: target.endpoint(),
            source: e,
        }),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(SessionError::Timeout(scope.timeout())),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(SessionError::Session(format!(
            "resolver for {} exited without a result",
            target.address
        ))),
    }
}

fn connect_tcp(target: &Target, scope: &CancelScope) -> Result<TcpStream, SessionError> {
    let endpoint = target.endpoint();
    let addrs = resolve_addrs(target, scope)?;

    let mut last_err = io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing");
    for addr in addrs {
        scope.check()?;
        match TcpStream::connect_timeout(&addr, scope.remaining()) {
            Ok(stream) => return Ok(stream),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(SessionError::Timeout(scope.timeout()));
            }
            Err(e) => last_err = e,
        }
    }
    Err(SessionError::Connect {
        endpoint,
        source: last_err,
    })
}

/// Report a timeout instead of whatever I/O error the aborted socket produced.
fn classify(scope: &CancelScope, detail: String) -> SessionError {
    if scope.is_expired() {
        SessionError::Timeout(scope.timeout())
    } else {
        SessionError::Session(detail)
    }
}

pub struct SshSession {
    session: ssh2::Session,
    scope: CancelScope,
    closed: bool,
}

impl SshSession {
    fn refresh_timeout(&self) -> Result<(), SessionError> {
        self.scope.check()?;
        self.session.set_timeout(timeout_ms(self.scope.remaining()));
        Ok(())
    }
}

impl Session for SshSession {
    fn run(&mut self, command: &str) -> Result<String, SessionError> {
        self.refresh_timeout()?;
        let scope = &self.scope;

        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| classify(scope, format!("open channel: {e}")))?;
        channel
            .handle_extended_data(ExtendedData::Merge)
            .map_err(|e| classify(scope, format!("merge stderr: {e}")))?;
        channel
            .exec(command)
            .map_err(|e| classify(scope, format!("exec: {e}")))?;

        let mut raw = Vec::new();
        channel
            .read_to_end(&mut raw)
            .map_err(|e| classify(scope, format!("read output: {e}")))?;
        channel
            .wait_close()
            .map_err(|e| classify(scope, format!("close channel: {e}")))?;
        let status = channel
            .exit_status()
            .map_err(|e| classify(scope, format!("exit status: {e}")))?;

        let output = String::from_utf8_lossy(&raw).into_owned();
        if status != 0 {
            return Err(SessionError::NonZeroExit { status, output });
        }
        Ok(output)
    }

    fn copy_tree(&mut self, local_root: &Path, remote_root: &str) -> Result<(), SessionError> {
        let plan = transfer::plan_copy(local_root, remote_root)?;
        self.refresh_timeout()?;
        let sftp = self
            .session
            .sftp()
            .map_err(|e| classify(&self.scope, format!("start sftp: {e}")))?;

        let mut remote = SftpFs {
            sftp: &sftp,
            scope: &self.scope,
        };
        let written = transfer::apply_plan(&mut remote, &plan, &self.scope)?;
        debug!(
            files = plan.file_count(),
            bytes = written,
            remote = remote_root,
            "copy finished"
        );
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.session.disconnect(None, "bye", None) {
            debug!(error = %e, "ssh disconnect failed");
        }
    }
}

struct SftpFs<'a> {
    sftp: &'a Sftp,
    scope: &'a CancelScope,
}

impl SftpFs<'_> {
    fn fail(&self, what: &str, path: &str, err: impl std::fmt::Display) -> SessionError {
        if self.scope.is_expired() {
            SessionError::Timeout(self.scope.timeout())
        } else {
            SessionError::Transfer(format!("{what} '{path}': {err}"))
        }
    }
}

impl RemoteFs for SftpFs<'_> {
    fn is_dir(&mut self, path: &str) -> Result<bool, SessionError> {
        match self.sftp.stat(Path::new(path)) {
            Ok(stat) if stat.is_dir() => Ok(true),
            Ok(_) => Err(self.fail("not a directory", path, "remote path exists")),
            Err(_) => Ok(false),
        }
    }

    fn mkdir(&mut self, path: &str, mode: u32) -> Result<(), SessionError> {
        self.sftp
            .mkdir(Path::new(path), mode as i32)
            .map_err(|e| self.fail("mkdir", path, e))
    }

    fn set_mode(&mut self, path: &str, mode: u32) -> Result<(), SessionError> {
        let stat = FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: Some(mode),
            atime: None,
            mtime: None,
        };
        self.sftp
            .setstat(Path::new(path), stat)
            .map_err(|e| self.fail("chmod", path, e))
    }

    fn write_file(
        &mut self,
        path: &str,
        mode: u32,
        contents: &mut dyn Read,
    ) -> Result<u64, SessionError> {
        let mut file = self
            .sftp
            .open_mode(
                Path::new(path),
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                mode as i32,
                OpenType::File,
            )
            .map_err(|e| self.fail("create", path, e))?;
        io::copy(contents, &mut file).map_err(|e| self.fail("write", path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_ms_never_returns_zero() {
        assert_eq!(timeout_ms(Duration::ZERO), 1);
        assert_eq!(timeout_ms(Duration::from_millis(1500)), 1500);
        assert_eq!(timeout_ms(Duration::from_secs(u64::MAX / 4)), u32::MAX);
    }

    #[test]
    fn refused_connection_is_a_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = Target {
            group: "local".into(),
            address: "127.0.0.1".into(),
            port,
            user: "root".into(),
            password: String::new(),
        };
        let scope = CancelScope::new(Duration::from_secs(5));
        let err = match SshConnector.connect(&target, &scope) {
            Ok(_) => panic!("nothing should be listening on port {port}"),
            Err(e) => e,
        };
        assert!(matches!(err, SessionError::Connect { .. }), "{err}");
        assert!(err.to_string().contains(&format!("127.0.0.1:{port}")), "{err}");
    }

    #[test]
    fn resolve_addrs_returns_literal_address() {
        let target = Target {
            group: "local".into(),
            address: "127.0.0.1".into(),
            port: 2022,
            user: "root".into(),
            password: String::new(),
        };
        let scope = CancelScope::new(Duration::from_secs(5));
        let addrs = resolve_addrs(&target, &scope).expect("literal address resolves");
        assert_eq!(addrs, vec!["127.0.0.1:2022".parse::<SocketAddr>().unwrap()]);
    }
}
