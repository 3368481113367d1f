//! TCP socket tuning
//!
//! Every connection gets `SO_KEEPALIVE` and `TCP_NODELAY` out of the box.
//! Callers can override or extend the TCP-level knobs with a
//! [`SocketSettings`] map; requested values are merged over the socket's
//! current values, so options the caller does not mention keep whatever the
//! kernel already had.

use std::collections::BTreeMap;
use std::io;
use std::net::TcpStream;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::SockRef;

/// TCP-level socket options that can be tuned per connection.
///
/// Variants the target platform does not expose are compiled out, so a
/// settings map can only name options the socket will accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TcpOption {
    /// TCP_CORK
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Cork,
    /// TCP_DEFER_ACCEPT
    #[cfg(any(target_os = "linux", target_os = "android"))]
    DeferAccept,
    /// TCP_KEEPCNT
    KeepCnt,
    /// TCP_KEEPIDLE
    #[cfg(any(target_os = "linux", target_os = "android"))]
    KeepIdle,
    /// TCP_KEEPINTVL
    KeepIntvl,
    /// TCP_LINGER2
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Linger2,
    /// TCP_MAXSEG
    MaxSeg,
    /// TCP_NODELAY
    NoDelay,
    /// TCP_QUICKACK
    #[cfg(any(target_os = "linux", target_os = "android"))]
    QuickAck,
    /// TCP_SYNCNT
    #[cfg(any(target_os = "linux", target_os = "android"))]
    SynCnt,
    /// TCP_WINDOW_CLAMP
    #[cfg(any(target_os = "linux", target_os = "android"))]
    WindowClamp,
}

impl TcpOption {
    /// All options known on this platform, in map order
    pub const ALL: &'static [TcpOption] = &[
        #[cfg(any(target_os = "linux", target_os = "android"))]
        TcpOption::Cork,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        TcpOption::DeferAccept,
        TcpOption::KeepCnt,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        TcpOption::KeepIdle,
        TcpOption::KeepIntvl,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        TcpOption::Linger2,
        TcpOption::MaxSeg,
        TcpOption::NoDelay,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        TcpOption::QuickAck,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        TcpOption::SynCnt,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        TcpOption::WindowClamp,
    ];

    #[cfg(unix)]
    fn raw(self) -> libc::c_int {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            TcpOption::Cork => libc::TCP_CORK,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            TcpOption::DeferAccept => libc::TCP_DEFER_ACCEPT,
            TcpOption::KeepCnt => libc::TCP_KEEPCNT,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            TcpOption::KeepIdle => libc::TCP_KEEPIDLE,
            TcpOption::KeepIntvl => libc::TCP_KEEPINTVL,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            TcpOption::Linger2 => libc::TCP_LINGER2,
            TcpOption::MaxSeg => libc::TCP_MAXSEG,
            TcpOption::NoDelay => libc::TCP_NODELAY,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            TcpOption::QuickAck => libc::TCP_QUICKACK,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            TcpOption::SynCnt => libc::TCP_SYNCNT,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            TcpOption::WindowClamp => libc::TCP_WINDOW_CLAMP,
        }
    }
}

/// Requested TCP option values, keyed by option
pub type SocketSettings = BTreeMap<TcpOption, i32>;

/// Apply keepalive, TCP options and I/O timeouts to a freshly connected
/// stream.
///
/// With no custom `settings` only `TCP_NODELAY` is enabled. With custom
/// settings, the socket's current option values are read first and the
/// requested values merged on top, then every resulting pair is applied.
pub fn configure(
    stream: &TcpStream,
    settings: Option<&SocketSettings>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
) -> io::Result<()> {
    SockRef::from(stream).set_keepalive(true)?;

    match settings {
        None => stream.set_nodelay(true)?,
        Some(overrides) => apply_tcp_options(stream, overrides)?,
    }

    if read_timeout.is_some() {
        stream.set_read_timeout(read_timeout)?;
    }
    if write_timeout.is_some() {
        stream.set_write_timeout(write_timeout)?;
    }

    Ok(())
}

/// Merge requested option values over the socket's current ones.
///
/// `TCP_NODELAY` is enabled unless the caller explicitly sets it, matching
/// what [`configure`] does when no custom settings are given.
fn merge(current: SocketSettings, overrides: &SocketSettings) -> SocketSettings {
    let mut merged = current;
    merged.entry(TcpOption::NoDelay).or_insert(1);
    for (&option, &value) in overrides {
        merged.insert(option, value);
    }
    merged
}

#[cfg(unix)]
fn apply_tcp_options(stream: &TcpStream, overrides: &SocketSettings) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    let mut current = SocketSettings::new();
    for &option in TcpOption::ALL {
        current.insert(option, get_tcp_option(fd, option)?);
    }

    let merged = merge(current, overrides);
    for (&option, &value) in &merged {
        set_tcp_option(fd, option, value)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_tcp_options(stream: &TcpStream, overrides: &SocketSettings) -> io::Result<()> {
    // Without raw socket options only TCP_NODELAY can be honored.
    let merged = merge(SocketSettings::new(), overrides);
    let nodelay = merged.get(&TcpOption::NoDelay).copied().unwrap_or(1);
    stream.set_nodelay(nodelay != 0)
}

#[cfg(unix)]
fn get_tcp_option(fd: std::os::unix::io::RawFd, option: TcpOption) -> io::Result<i32> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            option.raw(),
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(value)
    }
}

#[cfg(unix)]
fn set_tcp_option(fd: std::os::unix::io::RawFd, option: TcpOption, value: i32) -> io::Result<()> {
    let value: libc::c_int = value;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            option.raw(),
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_merge_defaults_nodelay_on() {
        let merged = merge(SocketSettings::new(), &SocketSettings::new());
        assert_eq!(merged.get(&TcpOption::NoDelay), Some(&1));
    }

    #[test]
    fn test_merge_keeps_unrelated_current_values() {
        let mut current = SocketSettings::new();
        current.insert(TcpOption::MaxSeg, 1460);
        current.insert(TcpOption::KeepCnt, 9);

        let mut overrides = SocketSettings::new();
        overrides.insert(TcpOption::KeepCnt, 3);

        let merged = merge(current, &overrides);
        assert_eq!(merged.get(&TcpOption::MaxSeg), Some(&1460));
        assert_eq!(merged.get(&TcpOption::KeepCnt), Some(&3));
        assert_eq!(merged.get(&TcpOption::NoDelay), Some(&1));
    }

    #[test]
    fn test_merge_caller_can_disable_nodelay() {
        let mut overrides = SocketSettings::new();
        overrides.insert(TcpOption::NoDelay, 0);

        let merged = merge(SocketSettings::new(), &overrides);
        assert_eq!(merged.get(&TcpOption::NoDelay), Some(&0));
    }

    #[test]
    fn test_configure_without_settings_enables_nodelay() {
        let (client, _server) = loopback_pair();
        configure(&client, None, None, None).unwrap();
        assert!(client.nodelay().unwrap());
    }

    #[test]
    fn test_configure_applies_custom_settings() {
        let (client, _server) = loopback_pair();

        let mut settings = SocketSettings::new();
        settings.insert(TcpOption::NoDelay, 0);
        configure(&client, Some(&settings), None, None).unwrap();

        assert!(!client.nodelay().unwrap());
    }

    #[test]
    fn test_configure_sets_timeouts() {
        let (client, _server) = loopback_pair();
        configure(
            &client,
            None,
            Some(Duration::from_secs(3)),
            Some(Duration::from_secs(7)),
        )
        .unwrap();

        assert_eq!(client.read_timeout().unwrap(), Some(Duration::from_secs(3)));
        assert_eq!(
            client.write_timeout().unwrap(),
            Some(Duration::from_secs(7))
        );
    }
}
