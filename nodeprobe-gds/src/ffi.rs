//! Dynamically loaded CUDA runtime and cuFile entry points

use std::ffi::{c_int, c_void};

use libloading::Library;
use nodeprobe_core::GdsError;
use tracing::trace;

const CUDART_NAMES: &[&str] = &["libcudart.so", "libcudart.so.12", "libcudart.so.11.0"];
const CUFILE_NAMES: &[&str] = &["libcufile.so", "libcufile.so.0"];

/// `cudaSuccess`
pub const CUDA_SUCCESS: c_int = 0;
/// `CU_FILE_SUCCESS`
pub const CU_FILE_SUCCESS: c_int = 0;
/// `CU_FILE_HANDLE_TYPE_OPAQUE_FD`
pub const CU_FILE_HANDLE_TYPE_OPAQUE_FD: c_int = 1;

/// `CUfileError_t`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CUfileError {
    pub err: c_int,
    #[allow(dead_code)]
    pub cu_err: c_int,
}

#[repr(C)]
pub union CUfileHandleUnion {
    pub fd: c_int,
    #[allow(dead_code)]
    pub handle: *mut c_void,
}

/// `CUfileDescr_t`
#[repr(C)]
pub struct CUfileDescr {
    pub type_: c_int,
    pub handle: CUfileHandleUnion,
    pub fs_ops: *const c_void,
}

/// `CUfileHandle_t`
pub type CUfileHandle = *mut c_void;

type CudaMalloc = unsafe extern "C" fn(*mut *mut c_void, usize) -> c_int;
type CudaFree = unsafe extern "C" fn(*mut c_void) -> c_int;
type CudaMemset = unsafe extern "C" fn(*mut c_void, c_int, usize) -> c_int;
type CudaDeviceSynchronize = unsafe extern "C" fn() -> c_int;

type CuFileDriver = unsafe extern "C" fn() -> CUfileError;
type CuFileBufRegister = unsafe extern "C" fn(*const c_void, usize, c_int) -> CUfileError;
type CuFileBufDeregister = unsafe extern "C" fn(*const c_void) -> CUfileError;
type CuFileHandleRegister = unsafe extern "C" fn(*mut CUfileHandle, *mut CUfileDescr) -> CUfileError;
pub type CuFileHandleDeregister = unsafe extern "C" fn(CUfileHandle);
type CuFileWrite = unsafe extern "C" fn(CUfileHandle, *const c_void, usize, i64, i64) -> isize;
type CuFileRead = unsafe extern "C" fn(CUfileHandle, *mut c_void, usize, i64, i64) -> isize;

/// Open the first library name that loads
pub fn open_first(names: &[&str]) -> Result<Library, GdsError> {
    let mut last_error = String::from("no candidates");
    for name in names {
        // SAFETY: loading runs the library's initialisers; CUDA libraries
        // have no unsound init-time requirements.
        match unsafe { Library::new(name) } {
            Ok(lib) => {
                trace!(library = %name, "Loaded library");
                return Ok(lib);
            }
            Err(e) => last_error = format!("{}: {}", name, e),
        }
    }
    Err(GdsError::Library(last_error))
}

/// Resolve a symbol and copy out the function pointer
///
/// # Safety
/// `T` must match the C signature of `name`, and the returned pointer must
/// not outlive `lib`.
unsafe fn symbol<T: Copy>(lib: &Library, name: &[u8]) -> Result<T, GdsError> {
    lib.get::<T>(name)
        .map(|sym| *sym)
        .map_err(|e| GdsError::Library(e.to_string()))
}

/// CUDA runtime API subset
pub struct CudaRuntime {
    pub malloc: CudaMalloc,
    pub free: CudaFree,
    pub memset: CudaMemset,
    pub synchronize: CudaDeviceSynchronize,
    _lib: Library,
}

impl CudaRuntime {
    pub fn load() -> Result<Self, GdsError> {
        let lib = open_first(CUDART_NAMES)?;
        // SAFETY: signatures match cuda_runtime_api.h; `_lib` keeps them alive.
        unsafe {
            Ok(Self {
                malloc: symbol(&lib, b"cudaMalloc\0")?,
                free: symbol(&lib, b"cudaFree\0")?,
                memset: symbol(&lib, b"cudaMemset\0")?,
                synchronize: symbol(&lib, b"cudaDeviceSynchronize\0")?,
                _lib: lib,
            })
        }
    }

    /// Map a `cudaError_t` to a result
    pub fn check(call: &'static str, code: c_int) -> Result<(), GdsError> {
        if code == CUDA_SUCCESS {
            Ok(())
        } else {
            Err(GdsError::Cuda { call, code })
        }
    }

    pub fn device_synchronize(&self) -> Result<(), GdsError> {
        // SAFETY: no arguments; valid whenever the runtime is loaded.
        Self::check("cudaDeviceSynchronize", unsafe { (self.synchronize)() })
    }
}

/// cuFile API subset
pub struct CufileLibrary {
    pub driver_open: CuFileDriver,
    pub driver_close: CuFileDriver,
    pub buf_register: CuFileBufRegister,
    pub buf_deregister: CuFileBufDeregister,
    pub handle_register: CuFileHandleRegister,
    pub handle_deregister: CuFileHandleDeregister,
    pub write: CuFileWrite,
    pub read: CuFileRead,
    _lib: Library,
}

impl CufileLibrary {
    pub fn load() -> Result<Self, GdsError> {
        let lib = open_first(CUFILE_NAMES)?;
        // SAFETY: signatures match cufile.h; `_lib` keeps them alive.
        unsafe {
            // Newer releases export the versioned close entry point
            let driver_close = symbol(&lib, b"cuFileDriverClose_v2\0")
                .or_else(|_| symbol(&lib, b"cuFileDriverClose\0"))?;
            Ok(Self {
                driver_open: symbol(&lib, b"cuFileDriverOpen\0")?,
                driver_close,
                buf_register: symbol(&lib, b"cuFileBufRegister\0")?,
                buf_deregister: symbol(&lib, b"cuFileBufDeregister\0")?,
                handle_register: symbol(&lib, b"cuFileHandleRegister\0")?,
                handle_deregister: symbol(&lib, b"cuFileHandleDeregister\0")?,
                write: symbol(&lib, b"cuFileWrite\0")?,
                read: symbol(&lib, b"cuFileRead\0")?,
                _lib: lib,
            })
        }
    }

    /// Map a `CUfileError_t` to a result
    pub fn check(call: &'static str, status: CUfileError) -> Result<(), GdsError> {
        if status.err == CU_FILE_SUCCESS {
            Ok(())
        } else {
            Err(GdsError::Cufile {
                call,
                code: i64::from(status.err),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_layout() {
        assert_eq!(std::mem::size_of::<CUfileError>(), 8);
        if cfg!(target_pointer_width = "64") {
            assert_eq!(std::mem::size_of::<CUfileDescr>(), 24);
        }
    }

    #[test]
    fn test_open_first_reports_last_error() {
        match open_first(&["libnodeprobe-missing.so"]) {
            Err(GdsError::Library(msg)) => assert!(msg.contains("libnodeprobe-missing.so")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("bogus library loaded"),
        }
    }

    #[test]
    fn test_status_mapping() {
        assert!(CudaRuntime::check("cudaMalloc", CUDA_SUCCESS).is_ok());
        assert_eq!(
            CudaRuntime::check("cudaMalloc", 2).unwrap_err().kind(),
            "CudaError"
        );

        let failed = CUfileError { err: 5030, cu_err: 0 };
        match CufileLibrary::check("cuFileDriverOpen", failed) {
            Err(GdsError::Cufile { call, code }) => {
                assert_eq!(call, "cuFileDriverOpen");
                assert_eq!(code, 5030);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
