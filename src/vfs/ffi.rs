//! C entry points binding [`StorageVfs`] to SQLite's VFS interface.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::slice;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::ffi;

use super::StorageVfs;
use crate::error::StorageError;
use crate::storage::RemoteFile;

/// Longest database name SQLite may hand us.
const MAX_PATHNAME: c_int = 1024;

/// Julian day number of the Unix epoch.
const UNIX_EPOCH_JULIAN_DAY: f64 = 2440587.5;

/// SQLite's per-connection file object. SQLite allocates `szOsFile` bytes
/// and we lay our state out after the base struct.
#[repr(C)]
struct FileHandle {
    base: ffi::sqlite3_file,
    vfs: *const StorageVfs,
    file: *mut RemoteFile,
}

static IO_METHODS: ffi::sqlite3_io_methods = ffi::sqlite3_io_methods {
    iVersion: 1,
    xClose: Some(x_close),
    xRead: Some(x_read),
    xWrite: Some(x_write),
    xTruncate: Some(x_truncate),
    xSync: Some(x_sync),
    xFileSize: Some(x_file_size),
    xLock: Some(x_lock),
    xUnlock: Some(x_unlock),
    xCheckReservedLock: Some(x_check_reserved_lock),
    xFileControl: Some(x_file_control),
    xSectorSize: Some(x_sector_size),
    xDeviceCharacteristics: Some(x_device_characteristics),
    xShmMap: None,
    xShmLock: None,
    xShmBarrier: None,
    xShmUnmap: None,
    xFetch: None,
    xUnfetch: None,
};

/// Register `vfs` with SQLite under its name.
///
/// The C structure, its name and one strong reference to `vfs` are leaked:
/// SQLite keeps pointers to them for as long as the VFS stays registered,
/// which is the rest of the process.
pub(super) fn register(vfs: Arc<StorageVfs>) -> Result<(), StorageError> {
    let name = CString::new(vfs.name())
        .map_err(|e| StorageError::Registration(e.to_string()))?;

    let raw = Box::into_raw(Box::new(ffi::sqlite3_vfs {
        iVersion: 1,
        szOsFile: std::mem::size_of::<FileHandle>() as c_int,
        mxPathname: MAX_PATHNAME,
        pNext: ptr::null_mut(),
        zName: name.into_raw(),
        pAppData: Arc::into_raw(vfs) as *mut c_void,
        xOpen: Some(x_open),
        xDelete: Some(x_delete),
        xAccess: Some(x_access),
        xFullPathname: Some(x_full_pathname),
        xDlOpen: None,
        xDlError: None,
        xDlSym: None,
        xDlClose: None,
        xRandomness: Some(x_randomness),
        xSleep: Some(x_sleep),
        xCurrentTime: Some(x_current_time),
        xGetLastError: Some(x_get_last_error),
        xCurrentTimeInt64: None,
        xSetSystemCall: None,
        xGetSystemCall: None,
        xNextSystemCall: None,
    }));

    let rc = unsafe { ffi::sqlite3_vfs_register(raw, 0) };
    if rc != ffi::SQLITE_OK {
        return Err(StorageError::Registration(format!(
            "sqlite3_vfs_register returned {}",
            rc
        )));
    }

    Ok(())
}

fn status(result: Result<(), StorageError>, on_err: c_int) -> c_int {
    match result {
        Ok(()) => ffi::SQLITE_OK,
        Err(_) => on_err,
    }
}

/// Run a callback body, turning a panic into `on_panic`.
fn guarded(on_panic: c_int, body: impl FnOnce() -> c_int) -> c_int {
    panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or(on_panic)
}

unsafe fn vfs_from<'a>(vfs: *mut ffi::sqlite3_vfs) -> &'a StorageVfs {
    &*((*vfs).pAppData as *const StorageVfs)
}

unsafe fn handle_from<'a>(file: *mut ffi::sqlite3_file) -> &'a mut FileHandle {
    &mut *(file as *mut FileHandle)
}

unsafe fn remote_from<'a>(file: *mut ffi::sqlite3_file) -> &'a RemoteFile {
    &*handle_from(file).file
}

unsafe fn name_from<'a>(name: *const c_char) -> Option<&'a str> {
    if name.is_null() {
        return None;
    }
    CStr::from_ptr(name).to_str().ok()
}

// =============================================================================
// VFS methods
// =============================================================================

unsafe extern "C" fn x_open(
    p_vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    p_file: *mut ffi::sqlite3_file,
    flags: c_int,
    p_out_flags: *mut c_int,
) -> c_int {
    // SQLite must not call xClose on a handle we failed to open
    (*p_file).pMethods = ptr::null();

    guarded(ffi::SQLITE_CANTOPEN, || {
        let vfs = vfs_from(p_vfs);

        let Some(name) = name_from(z_name) else {
            return ffi::SQLITE_CANTOPEN;
        };
        if flags & ffi::SQLITE_OPEN_MAIN_DB == 0 {
            return ffi::SQLITE_CANTOPEN;
        }

        let remote = match vfs.open(name) {
            Ok(remote) => remote,
            Err(err) => {
                vfs.record_error(name, err);
                return ffi::SQLITE_CANTOPEN;
            }
        };

        ptr::write(
            p_file as *mut FileHandle,
            FileHandle {
                base: ffi::sqlite3_file {
                    pMethods: &IO_METHODS,
                },
                vfs: vfs as *const StorageVfs,
                file: Box::into_raw(Box::new(remote)),
            },
        );

        if !p_out_flags.is_null() {
            *p_out_flags = (flags & !(ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE))
                | ffi::SQLITE_OPEN_READONLY;
        }

        ffi::SQLITE_OK
    })
}

unsafe extern "C" fn x_delete(
    p_vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    _sync_dir: c_int,
) -> c_int {
    guarded(ffi::SQLITE_IOERR_DELETE, || {
        let vfs = vfs_from(p_vfs);
        let _ = vfs.delete(name_from(z_name).unwrap_or_default());
        ffi::SQLITE_IOERR_DELETE
    })
}

unsafe extern "C" fn x_access(
    p_vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    flags: c_int,
    p_res_out: *mut c_int,
) -> c_int {
    guarded(ffi::SQLITE_IOERR_ACCESS, || {
        let vfs = vfs_from(p_vfs);
        let exists = match name_from(z_name) {
            Some(name) => flags != ffi::SQLITE_ACCESS_READWRITE && vfs.access(name),
            None => false,
        };
        *p_res_out = c_int::from(exists);
        ffi::SQLITE_OK
    })
}

unsafe extern "C" fn x_full_pathname(
    p_vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    n_out: c_int,
    z_out: *mut c_char,
) -> c_int {
    guarded(ffi::SQLITE_CANTOPEN, || {
        let vfs = vfs_from(p_vfs);
        let Some(name) = name_from(z_name) else {
            return ffi::SQLITE_CANTOPEN;
        };

        let full = vfs.full_pathname(name).as_bytes();
        if full.len() >= n_out.max(0) as usize {
            return ffi::SQLITE_CANTOPEN;
        }

        ptr::copy_nonoverlapping(full.as_ptr() as *const c_char, z_out, full.len());
        *z_out.add(full.len()) = 0;
        ffi::SQLITE_OK
    })
}

unsafe extern "C" fn x_randomness(
    _p_vfs: *mut ffi::sqlite3_vfs,
    n_byte: c_int,
    z_out: *mut c_char,
) -> c_int {
    ffi::sqlite3_randomness(n_byte, z_out as *mut c_void);
    n_byte
}

unsafe extern "C" fn x_sleep(_p_vfs: *mut ffi::sqlite3_vfs, microseconds: c_int) -> c_int {
    std::thread::sleep(Duration::from_micros(microseconds.max(0) as u64));
    microseconds
}

unsafe extern "C" fn x_current_time(_p_vfs: *mut ffi::sqlite3_vfs, p_out: *mut f64) -> c_int {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    *p_out = UNIX_EPOCH_JULIAN_DAY + secs / 86_400.0;
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_get_last_error(
    _p_vfs: *mut ffi::sqlite3_vfs,
    _n_byte: c_int,
    _z_err_msg: *mut c_char,
) -> c_int {
    0
}

// =============================================================================
// File methods
// =============================================================================

unsafe extern "C" fn x_close(p_file: *mut ffi::sqlite3_file) -> c_int {
    guarded(ffi::SQLITE_IOERR_CLOSE, || {
        let handle = handle_from(p_file);
        if !handle.file.is_null() {
            drop(Box::from_raw(handle.file));
            handle.file = ptr::null_mut();
        }
        ffi::SQLITE_OK
    })
}

unsafe extern "C" fn x_read(
    p_file: *mut ffi::sqlite3_file,
    p_buf: *mut c_void,
    i_amt: c_int,
    i_ofst: ffi::sqlite3_int64,
) -> c_int {
    guarded(ffi::SQLITE_IOERR_READ, || {
        let handle = handle_from(p_file);
        let (vfs, remote) = (&*handle.vfs, &*handle.file);
        let buf = slice::from_raw_parts_mut(p_buf as *mut u8, i_amt.max(0) as usize);

        match vfs.block_on(remote.read_at(buf, i_ofst.max(0) as u64)) {
            Ok(n) if n == buf.len() => ffi::SQLITE_OK,
            Ok(n) => {
                // SQLite requires the unread tail to be zeroed
                buf[n..].fill(0);
                ffi::SQLITE_IOERR_SHORT_READ
            }
            Err(err) => {
                vfs.record_error(&remote.uri().to_string(), err);
                ffi::SQLITE_IOERR_READ
            }
        }
    })
}

unsafe extern "C" fn x_write(
    p_file: *mut ffi::sqlite3_file,
    p_buf: *const c_void,
    i_amt: c_int,
    i_ofst: ffi::sqlite3_int64,
) -> c_int {
    guarded(ffi::SQLITE_READONLY, || {
        let buf = slice::from_raw_parts(p_buf as *const u8, i_amt.max(0) as usize);
        match remote_from(p_file).write_at(buf, i_ofst.max(0) as u64) {
            Ok(_) => ffi::SQLITE_OK,
            Err(_) => ffi::SQLITE_READONLY,
        }
    })
}

unsafe extern "C" fn x_truncate(p_file: *mut ffi::sqlite3_file, size: ffi::sqlite3_int64) -> c_int {
    guarded(ffi::SQLITE_READONLY, || {
        match remote_from(p_file).truncate(size.max(0) as u64) {
            Ok(()) => ffi::SQLITE_OK,
            Err(_) => ffi::SQLITE_READONLY,
        }
    })
}

unsafe extern "C" fn x_sync(p_file: *mut ffi::sqlite3_file, _flags: c_int) -> c_int {
    guarded(ffi::SQLITE_IOERR_FSYNC, || {
        status(remote_from(p_file).sync(), ffi::SQLITE_IOERR_FSYNC)
    })
}

unsafe extern "C" fn x_file_size(
    p_file: *mut ffi::sqlite3_file,
    p_size: *mut ffi::sqlite3_int64,
) -> c_int {
    guarded(ffi::SQLITE_IOERR_FSTAT, || {
        let handle = handle_from(p_file);
        let (vfs, remote) = (&*handle.vfs, &*handle.file);

        match vfs.block_on(remote.file_size()) {
            Ok(size) => {
                *p_size = size as ffi::sqlite3_int64;
                ffi::SQLITE_OK
            }
            Err(err) => {
                vfs.record_error(&remote.uri().to_string(), err);
                ffi::SQLITE_IOERR_FSTAT
            }
        }
    })
}

unsafe extern "C" fn x_lock(p_file: *mut ffi::sqlite3_file, _level: c_int) -> c_int {
    guarded(ffi::SQLITE_IOERR_LOCK, || {
        status(remote_from(p_file).lock(), ffi::SQLITE_IOERR_LOCK)
    })
}

unsafe extern "C" fn x_unlock(p_file: *mut ffi::sqlite3_file, _level: c_int) -> c_int {
    guarded(ffi::SQLITE_IOERR_UNLOCK, || {
        status(remote_from(p_file).unlock(), ffi::SQLITE_IOERR_UNLOCK)
    })
}

unsafe extern "C" fn x_check_reserved_lock(
    p_file: *mut ffi::sqlite3_file,
    p_res_out: *mut c_int,
) -> c_int {
    guarded(ffi::SQLITE_IOERR_CHECKRESERVEDLOCK, || {
        match remote_from(p_file).check_reserved_lock() {
            Ok(reserved) => {
                *p_res_out = c_int::from(reserved);
                ffi::SQLITE_OK
            }
            Err(_) => ffi::SQLITE_IOERR_CHECKRESERVEDLOCK,
        }
    })
}

unsafe extern "C" fn x_file_control(
    _p_file: *mut ffi::sqlite3_file,
    _op: c_int,
    _p_arg: *mut c_void,
) -> c_int {
    ffi::SQLITE_NOTFOUND
}

unsafe extern "C" fn x_sector_size(_p_file: *mut ffi::sqlite3_file) -> c_int {
    0
}

unsafe extern "C" fn x_device_characteristics(p_file: *mut ffi::sqlite3_file) -> c_int {
    guarded(0, || {
        if remote_from(p_file).is_immutable() {
            ffi::SQLITE_IOCAP_IMMUTABLE
        } else {
            0
        }
    })
}
