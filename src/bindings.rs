//! C Bindings for Tombs
//!
//! The host runtime drives the graveyard through these calls: it decides which
//! slot belongs to which declared function, populates slots as functions are
//! compiled and vacates them as they are first invoked.

use crate::config::TombsConfig;
use crate::graveyard::{Declaration, Graveyard};
use std::os::fd::{BorrowedFd, RawFd};
use std::io::{self, BufWriter, Write};
use std::os::raw::c_int;
use std::ptr;
use std::slice;
use std::str::Utf8Error;
use tracing::warn;

// Opaque handle
pub struct TombsGraveyardHandle(Graveyard);

/// Borrowed byte string; a null `ptr` means "absent"
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TombsStr {
    pub ptr: *const u8,
    pub len: usize,
}

impl TombsStr {
    unsafe fn as_str<'a>(&self) -> Result<Option<&'a str>, Utf8Error> {
        if self.ptr.is_null() {
            return Ok(None);
        }
        std::str::from_utf8(slice::from_raw_parts(self.ptr, self.len)).map(Some)
    }
}

#[repr(C)]
pub struct TombsDeclaration {
    pub file: TombsStr,
    pub scope: TombsStr,
    pub function: TombsStr,
    pub line_start: u32,
    pub line_end: u32,
}

/// Writes straight to a file descriptor the caller keeps ownership of
struct FdSink<'fd>(BorrowedFd<'fd>);

impl Write for FdSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        rustix::io::write(self.0, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn into_handle(result: crate::Result<Graveyard>) -> *mut TombsGraveyardHandle {
    match result {
        Ok(graveyard) => Box::into_raw(Box::new(TombsGraveyardHandle(graveyard))),
        Err(_) => ptr::null_mut(),
    }
}

/// Create a graveyard with `slots` tombs and a string arena of `strings_size` bytes
///
/// Returns null on failure.
#[no_mangle]
pub extern "C" fn tombs_graveyard_startup(
    slots: usize,
    strings_size: usize,
) -> *mut TombsGraveyardHandle {
    let config = TombsConfig {
        slots,
        strings_size,
        ..TombsConfig::default()
    };
    into_handle(Graveyard::from_config(&config))
}

/// Create a graveyard configured from `TOMBS_*` environment variables
///
/// Returns null on failure.
#[no_mangle]
pub extern "C" fn tombs_graveyard_startup_from_env() -> *mut TombsGraveyardHandle {
    match TombsConfig::from_env() {
        Ok(config) => into_handle(Graveyard::from_config(&config)),
        Err(e) => {
            warn!(error = %e, "Invalid graveyard configuration");
            ptr::null_mut()
        }
    }
}

/// Populate `slot` with a declared function
///
/// # Safety
/// `handle` must come from a startup call and not be shut down; every non-null
/// string in `declaration` must point to `len` readable bytes
#[no_mangle]
pub unsafe extern "C" fn tombs_graveyard_populate(
    handle: *const TombsGraveyardHandle,
    slot: usize,
    declaration: *const TombsDeclaration,
) {
    if handle.is_null() || declaration.is_null() {
        return;
    }
    let graveyard = &(*handle).0;
    let declaration = &*declaration;

    let (file, scope, function) = match (
        declaration.file.as_str(),
        declaration.scope.as_str(),
        declaration.function.as_str(),
    ) {
        (Ok(file), Ok(scope), Ok(Some(function))) => (file, scope, function),
        _ => {
            warn!(slot, "Rejected declaration with missing or non UTF-8 names");
            return;
        }
    };

    graveyard.populate(
        slot,
        &Declaration {
            file,
            scope,
            function,
            line_start: declaration.line_start,
            line_end: declaration.line_end,
        },
    );
}

/// Vacate `slot`
///
/// # Safety
/// `handle` must come from a startup call and not be shut down
#[no_mangle]
pub unsafe extern "C" fn tombs_graveyard_vacate(handle: *const TombsGraveyardHandle, slot: usize) {
    if handle.is_null() {
        return;
    }
    (*handle).0.vacate(slot);
}

/// Number of tombs currently populated
///
/// # Safety
/// `handle` must come from a startup call and not be shut down
#[no_mangle]
pub unsafe extern "C" fn tombs_graveyard_used(handle: *const TombsGraveyardHandle) -> usize {
    if handle.is_null() {
        return 0;
    }
    (*handle).0.used()
}

/// Dump populated tombs to `fd` as JSON lines
///
/// Best effort: write errors are logged and dropped. The descriptor is not
/// closed.
///
/// # Safety
/// `handle` must come from a startup call and not be shut down; `fd` must be
/// open for the duration of the call
#[no_mangle]
pub unsafe extern "C" fn tombs_graveyard_dump(handle: *const TombsGraveyardHandle, fd: c_int) {
    if handle.is_null() || fd < 0 {
        return;
    }
    let graveyard = &(*handle).0;
    let sink = BufWriter::new(FdSink(BorrowedFd::borrow_raw(fd as RawFd)));

    if let Err(e) = graveyard.dump(sink) {
        warn!(fd, error = %e, "Failed to dump graveyard");
    }
}

/// Close all tombs and release the graveyard
///
/// # Safety
/// `handle` must come from a startup call; it is invalid afterwards
#[no_mangle]
pub unsafe extern "C" fn tombs_graveyard_shutdown(handle: *mut TombsGraveyardHandle) {
    if !handle.is_null() {
        Box::from_raw(handle).0.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom};
    use std::os::fd::AsRawFd;

    fn tombs_str(s: &str) -> TombsStr {
        TombsStr {
            ptr: s.as_ptr(),
            len: s.len(),
        }
    }

    const ABSENT: TombsStr = TombsStr {
        ptr: ptr::null(),
        len: 0,
    };

    #[test]
    fn test_lifecycle_through_ffi() {
        let handle = tombs_graveyard_startup(4, 4096);
        assert!(!handle.is_null());

        let declaration = TombsDeclaration {
            file: tombs_str("a.php"),
            scope: ABSENT,
            function: tombs_str("foo"),
            line_start: 10,
            line_end: 20,
        };

        let mut file = tempfile();
        unsafe {
            tombs_graveyard_populate(handle, 0, &declaration);
            assert_eq!(tombs_graveyard_used(handle), 1);

            tombs_graveyard_dump(handle, file.as_raw_fd());

            tombs_graveyard_vacate(handle, 0);
            assert_eq!(tombs_graveyard_used(handle), 0);

            tombs_graveyard_shutdown(handle);
        }

        let mut out = String::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_string(&mut out).unwrap();
        assert_eq!(
            out,
            "{\"location\": {\"file\": \"a.php\", \"start\": 10, \"end\": 20}, \"function\": \"foo\"}\n"
        );
    }

    #[test]
    fn test_rejects_invalid_declaration() {
        let handle = tombs_graveyard_startup(2, 4096);
        let bad = [0xffu8, 0xfe];
        let declaration = TombsDeclaration {
            file: ABSENT,
            scope: TombsStr {
                ptr: bad.as_ptr(),
                len: bad.len(),
            },
            function: tombs_str("foo"),
            line_start: 1,
            line_end: 1,
        };
        let nameless = TombsDeclaration {
            file: ABSENT,
            scope: ABSENT,
            function: ABSENT,
            line_start: 1,
            line_end: 1,
        };

        unsafe {
            tombs_graveyard_populate(handle, 0, &declaration);
            tombs_graveyard_populate(handle, 1, &nameless);
            assert_eq!(tombs_graveyard_used(handle), 0);
            tombs_graveyard_shutdown(handle);
        }
    }

    #[test]
    fn test_null_handle() {
        assert!(tombs_graveyard_startup(0, 4096).is_null());
        unsafe {
            tombs_graveyard_vacate(ptr::null(), 0);
            tombs_graveyard_dump(ptr::null(), 1);
            assert_eq!(tombs_graveyard_used(ptr::null()), 0);
            tombs_graveyard_shutdown(ptr::null_mut());
        }
    }

    fn tempfile() -> File {
        let path = std::env::temp_dir().join(format!(
            "tombs-dump-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        let _ = std::fs::remove_file(&path);
        file
    }
}
