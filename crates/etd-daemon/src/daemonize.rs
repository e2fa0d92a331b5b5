//! Unix double-fork daemonization (spec.md §6), ported line-for-line from
//! `do_daemonize()` in `examples/original_source/src/etd.cc`: clear the
//! umask, fork twice (parent exits each time), become session leader,
//! `chdir("/")`, close every fd except stderr (already pointed at
//! syslog), and reattach stdin/stdout to `/dev/null`.
//!
//! Must run before the tokio runtime starts — forking a multi-threaded
//! process loses every thread but the one that called `fork` in the
//! child, which would orphan the runtime's worker threads.

#[cfg(unix)]
pub fn daemonize() -> std::io::Result<()> {
    use std::ffi::CString;

    unsafe {
        libc::umask(0);

        match libc::fork() {
            -1 => return Err(std::io::Error::last_os_error()),
            0 => {}
            _ => libc::_exit(0),
        }

        if libc::setsid() == -1 {
            return Err(std::io::Error::last_os_error());
        }

        match libc::fork() {
            -1 => return Err(std::io::Error::last_os_error()),
            0 => {}
            _ => libc::_exit(0),
        }

        let root = CString::new("/").unwrap();
        if libc::chdir(root.as_ptr()) != 0 {
            return Err(std::io::Error::last_os_error());
        }

        let max_fd = match libc::sysconf(libc::_SC_OPEN_MAX) {
            -1 => 1024,
            n => n,
        };
        for fd in 0..max_fd as i32 {
            if fd != libc::STDERR_FILENO {
                libc::close(fd);
            }
        }

        let devnull = CString::new("/dev/null").unwrap();
        let fd0 = libc::open(devnull.as_ptr(), libc::O_RDWR);
        let fd1 = libc::dup(0);
        if fd0 != 0 || fd1 != 1 {
            return Err(std::io::Error::other(
                "failed attaching stdin/stdout to /dev/null",
            ));
        }
    }
    Ok(())
}

/// Redirect this process's effective/real uid and gid to `user`'s
/// (spec.md §6, `--run-as`). Must happen after any privileged bind but
/// before serving untrusted input.
#[cfg(unix)]
pub fn drop_privileges(user: &str) -> eyre::Result<()> {
    use std::ffi::CString;

    let cname = CString::new(user).map_err(|_| eyre::eyre!("invalid user name '{user}'"))?;
    let pwd = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pwd.is_null() {
        eyre::bail!("unknown user '{user}'");
    }
    let (uid, gid) = unsafe { ((*pwd).pw_uid, (*pwd).pw_gid) };

    unsafe {
        if libc::setgid(gid) != 0 {
            eyre::bail!(
                "setgid({gid}) failed: {}",
                std::io::Error::last_os_error()
            );
        }
        if libc::setuid(uid) != 0 {
            eyre::bail!(
                "setuid({uid}) failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
    Ok(())
}
