use std::ffi::{CStr, CString};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

struct FdGuard(RawFd);

impl FdGuard {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for FdGuard {
    fn drop(&mut self) {
        if self.0 >= 0 {
            unsafe {
                libc::close(self.0);
            }
        }
    }
}

/// Open directory stream, closed on drop
struct DirGuard(*mut libc::DIR);

impl Drop for DirGuard {
    fn drop(&mut self) {
        unsafe {
            libc::closedir(self.0);
        }
    }
}

fn with_context(context: impl std::fmt::Display) -> io::Error {
    let err = io::Error::last_os_error();
    io::Error::new(err.kind(), format!("{}: {}", context, err))
}

fn path_to_cstring(bytes: &[u8], path: &Path) -> io::Result<CString> {
    CString::new(bytes).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Path contains NUL byte and cannot be removed safely: {}", path.display()),
        )
    })
}

fn open_dir_nofollow(path: &Path) -> io::Result<FdGuard> {
    let path_c = path_to_cstring(path.as_os_str().as_bytes(), path)?;
    let fd = unsafe {
        libc::open(
            path_c.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(with_context(format!("open directory failed for {}", path.display())));
    }
    Ok(FdGuard(fd))
}

fn fstatat_nofollow(parent_fd: RawFd, name: &CStr) -> io::Result<libc::stat> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed();
    let rc = unsafe {
        libc::fstatat(
            parent_fd,
            name.as_ptr(),
            st.as_mut_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(with_context(format!("fstatat failed for {:?}", name)));
    }
    Ok(unsafe { st.assume_init() })
}

fn remove_entry_at(parent_fd: RawFd, name: &CStr, flags: i32) -> io::Result<()> {
    let rc = unsafe { libc::unlinkat(parent_fd, name.as_ptr(), flags) };
    if rc != 0 {
        return Err(with_context(format!("unlinkat failed for {:?}", name)));
    }
    Ok(())
}

fn recurse_remove_dir(parent_fd: RawFd, name: &CStr, root_dev: libc::dev_t) -> io::Result<()> {
    let child_fd = unsafe {
        libc::openat(
            parent_fd,
            name.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
        )
    };
    if child_fd < 0 {
        return Err(with_context(format!("openat failed for directory {:?}", name)));
    }
    let child = FdGuard(child_fd);

    remove_dir_contents_fd(child.as_raw_fd(), root_dev)?;
    remove_entry_at(parent_fd, name, libc::AT_REMOVEDIR)
}

fn remove_dir_contents_fd(dir_fd: RawFd, root_dev: libc::dev_t) -> io::Result<()> {
    let iter_fd = unsafe { libc::dup(dir_fd) };
    if iter_fd < 0 {
        return Err(with_context("dup for directory iteration failed"));
    }

    let dir = unsafe { libc::fdopendir(iter_fd) };
    if dir.is_null() {
        let err = with_context("fdopendir failed");
        unsafe {
            libc::close(iter_fd);
        }
        return Err(err);
    }
    let dir = DirGuard(dir);

    // Names are collected before anything is unlinked.
    let mut names = Vec::new();
    loop {
        unsafe {
            *libc::__errno_location() = 0;
        }
        let entry = unsafe { libc::readdir(dir.0) };
        if entry.is_null() {
            let errno = unsafe { *libc::__errno_location() };
            if errno != 0 {
                let err = io::Error::from_raw_os_error(errno);
                return Err(io::Error::new(err.kind(), format!("readdir failed: {}", err)));
            }
            break;
        }

        let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
        let bytes = name.to_bytes();
        if bytes == b"." || bytes == b".." {
            continue;
        }
        names.push(name.to_owned());
    }
    drop(dir);

    for name in names {
        let st = fstatat_nofollow(dir_fd, &name)?;
        if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
            if st.st_dev != root_dev {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("Refusing to cross filesystem boundary at directory {:?}", name),
                ));
            }
            recurse_remove_dir(dir_fd, &name, root_dev)?;
        } else {
            remove_entry_at(dir_fd, &name, 0)?;
        }
    }

    Ok(())
}

/// Remove a tree without following symlinks, using openat/fstatat/unlinkat.
///
/// A symlink inside the tree is unlinked, never traversed. Mount points below
/// `path` are left alone and reported as an error.
pub fn remove_tree_secure(path: &Path) -> io::Result<()> {
    if path.symlink_metadata().is_err() {
        return Ok(());
    }

    let parent = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Cannot remove path without parent: {}", path.display()),
        )
    })?;
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Cannot remove path without file name: {}", path.display()),
        )
    })?;
    let name_c = path_to_cstring(name.as_bytes(), path)?;

    let parent_fd = open_dir_nofollow(parent)?;
    let st = fstatat_nofollow(parent_fd.as_raw_fd(), &name_c)?;

    if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
        recurse_remove_dir(parent_fd.as_raw_fd(), &name_c, st.st_dev)
    } else {
        remove_entry_at(parent_fd.as_raw_fd(), &name_c, 0)
    }
}
