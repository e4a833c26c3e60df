//! GPU Direct Storage backend
//!
//! Implements [`DirectStorage`] on top of the CUDA runtime and NVIDIA cuFile.
//! Both libraries are loaded at probe time, so hosts without them still run
//! every other probe. Device presence is checked through NVML.

mod ffi;

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nodeprobe_core::benchmark::{LIBRARY_UNAVAILABLE, NO_DEVICE};
use nodeprobe_core::{Capability, DirectStorage, GdsError, GdsSession};
use nvml_wrapper::Nvml;
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use ffi::{
    CUfileDescr, CUfileHandle, CUfileHandleUnion, CuFileHandleDeregister, CudaRuntime,
    CufileLibrary, CU_FILE_HANDLE_TYPE_OPAQUE_FD,
};

/// Global NVML instance
static NVML: OnceCell<Arc<Nvml>> = OnceCell::new();

fn get_nvml() -> Result<&'static Arc<Nvml>, String> {
    NVML.get_or_try_init(|| Nvml::init().map(Arc::new).map_err(|e| e.to_string()))
}

/// Number of NVIDIA devices visible to NVML
fn device_count() -> Result<u32, String> {
    get_nvml()?.device_count().map_err(|e| e.to_string())
}

/// cuFile-backed GPU Direct Storage capability
#[derive(Debug, Clone, Copy, Default)]
pub struct CufileBackend;

impl CufileBackend {
    /// Create a new backend
    pub fn new() -> Self {
        Self
    }
}

impl DirectStorage for CufileBackend {
    fn probe(&self) -> Capability {
        let libraries = CudaRuntime::load().and_then(|cuda| Ok((cuda, CufileLibrary::load()?)));
        let (cuda, cufile) = match libraries {
            Ok(libraries) => libraries,
            Err(e) => {
                debug!(error = %e, "GDS libraries not loadable");
                return Capability::Unavailable(LIBRARY_UNAVAILABLE.to_string());
            }
        };

        match device_count() {
            Ok(count) if count > 0 => debug!(count, "CUDA devices present"),
            Ok(_) => return Capability::Unavailable(NO_DEVICE.to_string()),
            Err(e) => {
                debug!(error = %e, "NVML unavailable");
                return Capability::Unavailable(NO_DEVICE.to_string());
            }
        }

        match CufileSession::open(cuda, cufile) {
            Ok(session) => {
                info!("cuFile driver opened");
                Capability::Available(Box::new(session))
            }
            Err(e) => {
                warn!(error = %e, "cuFile driver could not be opened");
                Capability::Unavailable(LIBRARY_UNAVAILABLE.to_string())
            }
        }
    }
}

struct DeviceBuffer {
    ptr: *mut c_void,
    size: usize,
}

/// A registered cuFile file handle, deregistered on drop
struct RegisteredFile {
    handle: CUfileHandle,
    deregister: CuFileHandleDeregister,
    _file: File,
}

impl Drop for RegisteredFile {
    fn drop(&mut self) {
        // SAFETY: `handle` came from a successful cuFileHandleRegister and the
        // descriptor is still open.
        unsafe { (self.deregister)(self.handle) };
    }
}

#[derive(Clone, Copy)]
enum Transfer {
    Write,
    Read,
}

/// Open cuFile driver with at most one registered device buffer
pub struct CufileSession {
    cuda: CudaRuntime,
    cufile: CufileLibrary,
    buffer: Option<DeviceBuffer>,
}

// SAFETY: the raw pointers are CUDA device addresses and cuFile handles,
// which are valid from any host thread of the process.
unsafe impl Send for CufileSession {}

impl CufileSession {
    fn open(cuda: CudaRuntime, cufile: CufileLibrary) -> Result<Self, GdsError> {
        // SAFETY: no arguments; the library stays loaded for the session.
        CufileLibrary::check("cuFileDriverOpen", unsafe { (cufile.driver_open)() })?;
        Ok(Self {
            cuda,
            cufile,
            buffer: None,
        })
    }

    fn release_buffer(&mut self) {
        let Some(buffer) = self.buffer.take() else {
            return;
        };
        // SAFETY: the buffer was allocated and registered by `allocate`.
        unsafe {
            let status = (self.cufile.buf_deregister)(buffer.ptr);
            if let Err(e) = CufileLibrary::check("cuFileBufDeregister", status) {
                debug!(error = %e, "Buffer deregistration failed");
            }
            if let Err(e) = CudaRuntime::check("cudaFree", (self.cuda.free)(buffer.ptr)) {
                debug!(error = %e, "Device free failed");
            }
        }
    }

    fn register(&self, file: File) -> Result<RegisteredFile, GdsError> {
        let mut descr = CUfileDescr {
            type_: CU_FILE_HANDLE_TYPE_OPAQUE_FD,
            handle: CUfileHandleUnion {
                fd: file.as_raw_fd(),
            },
            fs_ops: ptr::null(),
        };
        let mut handle: CUfileHandle = ptr::null_mut();
        // SAFETY: both pointers reference live locals for the duration of the call.
        let status = unsafe { (self.cufile.handle_register)(&mut handle, &mut descr) };
        CufileLibrary::check("cuFileHandleRegister", status)?;
        Ok(RegisteredFile {
            handle,
            deregister: self.cufile.handle_deregister,
            _file: file,
        })
    }

    fn transfer(&mut self, path: &Path, size: usize, kind: Transfer) -> Result<Duration, GdsError> {
        let (ptr, capacity) = match &self.buffer {
            Some(buffer) => (buffer.ptr, buffer.size),
            None => return Err(GdsError::NoBuffer),
        };
        if size > capacity {
            return Err(GdsError::NoBuffer);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(matches!(kind, Transfer::Write))
            .custom_flags(libc::O_DIRECT)
            .open(path)?;
        let registered = self.register(file)?;

        self.cuda.device_synchronize()?;
        let start = Instant::now();
        // SAFETY: `ptr` is a registered device buffer of at least `size` bytes
        // and `registered.handle` is a live cuFile handle.
        let (call, transferred) = unsafe {
            match kind {
                Transfer::Write => (
                    "cuFileWrite",
                    (self.cufile.write)(registered.handle, ptr, size, 0, 0),
                ),
                Transfer::Read => (
                    "cuFileRead",
                    (self.cufile.read)(registered.handle, ptr, size, 0, 0),
                ),
            }
        };
        self.cuda.device_synchronize()?;
        let elapsed = start.elapsed();
        drop(registered);

        if transferred < 0 {
            return Err(GdsError::Cufile {
                call,
                code: transferred as i64,
            });
        }
        if transferred as usize != size {
            return Err(GdsError::ShortTransfer {
                expected: size,
                actual: transferred as i64,
            });
        }
        Ok(elapsed)
    }
}

impl GdsSession for CufileSession {
    fn allocate(&mut self, size: usize) -> Result<(), GdsError> {
        self.release_buffer();

        let mut ptr: *mut c_void = ptr::null_mut();
        // SAFETY: `ptr` is a valid out-pointer.
        CudaRuntime::check("cudaMalloc", unsafe { (self.cuda.malloc)(&mut ptr, size) })?;

        // SAFETY: `ptr` is a fresh device allocation of `size` bytes.
        let status = unsafe { (self.cufile.buf_register)(ptr, size, 0) };
        if let Err(e) = CufileLibrary::check("cuFileBufRegister", status) {
            // SAFETY: allocated above and not registered.
            unsafe { (self.cuda.free)(ptr) };
            return Err(e);
        }

        debug!(size, "Registered device buffer");
        self.buffer = Some(DeviceBuffer { ptr, size });
        Ok(())
    }

    fn zero(&mut self) -> Result<(), GdsError> {
        let buffer = self.buffer.as_ref().ok_or(GdsError::NoBuffer)?;
        // SAFETY: the buffer is a live device allocation of `buffer.size` bytes.
        CudaRuntime::check("cudaMemset", unsafe {
            (self.cuda.memset)(buffer.ptr, 0, buffer.size)
        })?;
        self.cuda.device_synchronize()
    }

    fn write(&mut self, path: &Path, size: usize) -> Result<Duration, GdsError> {
        self.transfer(path, size, Transfer::Write)
    }

    fn read(&mut self, path: &Path, size: usize) -> Result<Duration, GdsError> {
        self.transfer(path, size, Transfer::Read)
    }
}

impl Drop for CufileSession {
    fn drop(&mut self) {
        self.release_buffer();
        // SAFETY: the driver was opened in `open`.
        let status = unsafe { (self.cufile.driver_close)() };
        if let Err(e) = CufileLibrary::check("cuFileDriverClose", status) {
            debug!(error = %e, "cuFile driver close failed");
        }
    }
}
