// ============================================================================
// AI OPERATIONS — model boundary + ONNX Runtime backend
// ============================================================================
//
// Uses `libloading` to load onnxruntime.dll / libonnxruntime.so at startup,
// so the binary has NO compile-time dependency on ONNX Runtime. One session is
// created when the app starts and reused for every prediction.

#![allow(unsafe_op_in_unsafe_fn)]
#![allow(unused_unsafe)]

use std::ffi::{CStr, CString, c_char, c_void};
use std::path::{Component, Path};
use std::sync::Mutex;

use super::preprocess::ModelInput;

/// The opaque classifier: one float tensor in, one score per class out.
pub trait DigitModel: Send + Sync {
    fn predict(&self, input: &ModelInput) -> Result<Vec<f32>, ModelError>;
}

/// Errors raised while loading or running the model.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    LibraryNotFound(String),
    LibraryLoadFailed(String),
    ModelNotFound(String),
    ModelLoadFailed(String),
    ApiInitFailed(String),
    SessionCreateFailed(String),
    InferenceFailed(String),
    InvalidInput(String),
    InvalidOutput(String),
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelError::LibraryNotFound(p) => write!(f, "ONNX Runtime library not found: {}", p),
            ModelError::LibraryLoadFailed(e) => {
                write!(f, "Failed to load ONNX Runtime library: {}", e)
            }
            ModelError::ModelNotFound(p) => write!(f, "Model file not found: {}", p),
            ModelError::ModelLoadFailed(e) => write!(f, "Failed to load model: {}", e),
            ModelError::ApiInitFailed(e) => write!(f, "ONNX Runtime API init failed: {}", e),
            ModelError::SessionCreateFailed(e) => write!(f, "Failed to create session: {}", e),
            ModelError::InferenceFailed(e) => write!(f, "Inference failed: {}", e),
            ModelError::InvalidInput(e) => write!(f, "Invalid model input: {}", e),
            ModelError::InvalidOutput(e) => write!(f, "Invalid model output: {}", e),
        }
    }
}

impl std::error::Error for ModelError {}

// --- ONNX Runtime C API types --------------------------------------
// Opaque handles mirroring onnxruntime_c_api.h; only used as pointers.

#[repr(C)]
struct OrtEnv {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtSession {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtSessionOptions {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtValue {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtMemoryInfo {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtStatus {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtRunOptions {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtAllocator {
    _private: [u8; 0],
}
#[repr(C)]
struct OrtTensorTypeAndShapeInfo {
    _private: [u8; 0],
}

/// ORT API version we target (compatible with ONNX Runtime 1.16+)
const ORT_API_VERSION: u32 = 18;

/// Versions older than this used a different vtable layout for API version 18.
const ORT_MIN_VERSION: (u32, u32) = (1, 16);

/// ORT_ENABLE_ALL
const GRAPH_OPTIMIZATION_ALL: u32 = 99;

#[repr(u32)]
enum OrtLoggingLevel {
    Warning = 2,
}

#[repr(u32)]
enum ONNXTensorElementDataType {
    Float = 1,
}

#[repr(i32)]
enum OrtAllocatorType {
    ArenaAllocator = 1,
}

#[repr(i32)]
enum OrtMemType {
    Default = 0,
}

/// ORTCHAR_T: wide on Windows, narrow everywhere else.
#[cfg(windows)]
type PathChar = u16;
#[cfg(not(windows))]
type PathChar = c_char;

type CreateEnvFn = unsafe extern "C" fn(
    log_level: OrtLoggingLevel,
    logid: *const c_char,
    out: *mut *mut OrtEnv,
) -> *mut OrtStatus;
type CreateSessionOptionsFn =
    unsafe extern "C" fn(out: *mut *mut OrtSessionOptions) -> *mut OrtStatus;
type CreateSessionFn = unsafe extern "C" fn(
    env: *const OrtEnv,
    model_path: *const PathChar,
    options: *const OrtSessionOptions,
    out: *mut *mut OrtSession,
) -> *mut OrtStatus;
type CreateTensorWithDataAsOrtValueFn = unsafe extern "C" fn(
    info: *const OrtMemoryInfo,
    data: *mut c_void,
    data_len: usize,
    shape: *const i64,
    shape_len: usize,
    element_type: ONNXTensorElementDataType,
    out: *mut *mut OrtValue,
) -> *mut OrtStatus;
type CreateCpuMemoryInfoFn = unsafe extern "C" fn(
    alloc_type: OrtAllocatorType,
    mem_type: OrtMemType,
    out: *mut *mut OrtMemoryInfo,
) -> *mut OrtStatus;
type RunFn = unsafe extern "C" fn(
    session: *mut OrtSession,
    run_options: *const OrtRunOptions,
    input_names: *const *const c_char,
    inputs: *const *const OrtValue,
    input_count: usize,
    output_names: *const *const c_char,
    output_count: usize,
    outputs: *mut *mut OrtValue,
) -> *mut OrtStatus;
type GetTensorMutableDataFn =
    unsafe extern "C" fn(value: *mut OrtValue, out: *mut *mut c_void) -> *mut OrtStatus;
type GetTensorTypeAndShapeFn = unsafe extern "C" fn(
    value: *const OrtValue,
    out: *mut *mut OrtTensorTypeAndShapeInfo,
) -> *mut OrtStatus;
type GetDimensionsCountFn =
    unsafe extern "C" fn(info: *const OrtTensorTypeAndShapeInfo, out: *mut usize) -> *mut OrtStatus;
type GetDimensionsFn = unsafe extern "C" fn(
    info: *const OrtTensorTypeAndShapeInfo,
    dim_values: *mut i64,
    dim_values_length: usize,
) -> *mut OrtStatus;
type ReleaseEnvFn = unsafe extern "C" fn(env: *mut OrtEnv);
type ReleaseSessionFn = unsafe extern "C" fn(session: *mut OrtSession);
type ReleaseSessionOptionsFn = unsafe extern "C" fn(options: *mut OrtSessionOptions);
type ReleaseValueFn = unsafe extern "C" fn(value: *mut OrtValue);
type ReleaseMemoryInfoFn = unsafe extern "C" fn(info: *mut OrtMemoryInfo);
type ReleaseTensorTypeAndShapeInfoFn = unsafe extern "C" fn(info: *mut OrtTensorTypeAndShapeInfo);
type ReleaseStatusFn = unsafe extern "C" fn(status: *mut OrtStatus);
type GetErrorMessageFn = unsafe extern "C" fn(status: *const OrtStatus) -> *const c_char;
type SetIntraOpNumThreadsFn = unsafe extern "C" fn(
    options: *mut OrtSessionOptions,
    intra_op_num_threads: i32,
) -> *mut OrtStatus;
type SetSessionGraphOptimizationLevelFn = unsafe extern "C" fn(
    options: *mut OrtSessionOptions,
    graph_optimization_level: u32,
) -> *mut OrtStatus;
type SessionGetCountFn =
    unsafe extern "C" fn(session: *const OrtSession, out: *mut usize) -> *mut OrtStatus;
type SessionGetNameFn = unsafe extern "C" fn(
    session: *const OrtSession,
    index: usize,
    allocator: *mut OrtAllocator,
    out: *mut *mut c_char,
) -> *mut OrtStatus;
type GetAllocatorWithDefaultOptionsFn =
    unsafe extern "C" fn(out: *mut *mut OrtAllocator) -> *mut OrtStatus;
type AllocatorFreeFn =
    unsafe extern "C" fn(allocator: *mut OrtAllocator, ptr: *mut c_void) -> *mut OrtStatus;

/// OrtApiBase — the entry point struct returned by OrtGetApiBase()
#[repr(C)]
struct OrtApiBase {
    get_api: unsafe extern "C" fn(version: u32) -> *const c_void,
    get_version_string: unsafe extern "C" fn() -> *const c_char,
}

/// The OrtApi vtable: a flat array of function pointers indexed by position.
struct OrtApi {
    raw: *const c_void,
}

impl OrtApi {
    unsafe fn get_fn<T>(&self, index: usize) -> T {
        let ptr = self.raw as *const *const c_void;
        let fn_ptr = *ptr.add(index);
        std::mem::transmute_copy(&fn_ptr)
    }

    // Indices from onnxruntime_c_api.h:
    //  2: GetErrorMessage   3: CreateEnv   7: CreateSession   9: Run
    // 10: CreateSessionOptions   23: SetSessionGraphOptimizationLevel
    // 24: SetIntraOpNumThreads   30/31: SessionGetInput/OutputCount
    // 36/37: SessionGetInput/OutputName   49: CreateTensorWithDataAsOrtValue
    // 51: GetTensorMutableData   61: GetDimensionsCount   62: GetDimensions
    // 65: GetTensorTypeAndShape  69: CreateCpuMemoryInfo  76: AllocatorFree
    // 78: GetAllocatorWithDefaultOptions   92: ReleaseEnv   93: ReleaseStatus
    // 94: ReleaseMemoryInfo  95: ReleaseSession  96: ReleaseValue
    // 99: ReleaseTensorTypeAndShapeInfo  100: ReleaseSessionOptions

    fn get_error_message(&self) -> GetErrorMessageFn {
        unsafe { self.get_fn(2) }
    }
    fn create_env(&self) -> CreateEnvFn {
        unsafe { self.get_fn(3) }
    }
    fn create_session(&self) -> CreateSessionFn {
        unsafe { self.get_fn(7) }
    }
    fn run(&self) -> RunFn {
        unsafe { self.get_fn(9) }
    }
    fn create_session_options(&self) -> CreateSessionOptionsFn {
        unsafe { self.get_fn(10) }
    }
    fn set_session_graph_optimization_level(&self) -> SetSessionGraphOptimizationLevelFn {
        unsafe { self.get_fn(23) }
    }
    fn set_intra_op_num_threads(&self) -> SetIntraOpNumThreadsFn {
        unsafe { self.get_fn(24) }
    }
    fn session_get_input_count(&self) -> SessionGetCountFn {
        unsafe { self.get_fn(30) }
    }
    fn session_get_output_count(&self) -> SessionGetCountFn {
        unsafe { self.get_fn(31) }
    }
    fn session_get_input_name(&self) -> SessionGetNameFn {
        unsafe { self.get_fn(36) }
    }
    fn session_get_output_name(&self) -> SessionGetNameFn {
        unsafe { self.get_fn(37) }
    }
    fn create_tensor_with_data(&self) -> CreateTensorWithDataAsOrtValueFn {
        unsafe { self.get_fn(49) }
    }
    fn get_tensor_mutable_data(&self) -> GetTensorMutableDataFn {
        unsafe { self.get_fn(51) }
    }
    fn get_dimensions_count(&self) -> GetDimensionsCountFn {
        unsafe { self.get_fn(61) }
    }
    fn get_dimensions(&self) -> GetDimensionsFn {
        unsafe { self.get_fn(62) }
    }
    fn get_tensor_type_and_shape(&self) -> GetTensorTypeAndShapeFn {
        unsafe { self.get_fn(65) }
    }
    fn create_cpu_memory_info(&self) -> CreateCpuMemoryInfoFn {
        unsafe { self.get_fn(69) }
    }
    fn allocator_free(&self) -> AllocatorFreeFn {
        unsafe { self.get_fn(76) }
    }
    fn get_allocator_with_default_options(&self) -> GetAllocatorWithDefaultOptionsFn {
        unsafe { self.get_fn(78) }
    }
    fn release_env(&self) -> ReleaseEnvFn {
        unsafe { self.get_fn(92) }
    }
    fn release_status(&self) -> ReleaseStatusFn {
        unsafe { self.get_fn(93) }
    }
    fn release_memory_info(&self) -> ReleaseMemoryInfoFn {
        unsafe { self.get_fn(94) }
    }
    fn release_session(&self) -> ReleaseSessionFn {
        unsafe { self.get_fn(95) }
    }
    fn release_value(&self) -> ReleaseValueFn {
        unsafe { self.get_fn(96) }
    }
    fn release_tensor_type_and_shape_info(&self) -> ReleaseTensorTypeAndShapeInfoFn {
        unsafe { self.get_fn(99) }
    }
    fn release_session_options(&self) -> ReleaseSessionOptionsFn {
        unsafe { self.get_fn(100) }
    }
}

/// Turn an OrtStatus into a Result, releasing the status. Null means success.
unsafe fn status_to_result(api: &OrtApi, status: *mut OrtStatus) -> Result<(), String> {
    if status.is_null() {
        return Ok(());
    }
    let msg_ptr = (api.get_error_message())(status);
    let msg = if msg_ptr.is_null() {
        "Unknown error".to_string()
    } else {
        CStr::from_ptr(msg_ptr).to_string_lossy().into_owned()
    };
    (api.release_status())(status);
    Err(msg)
}

// ============================================================================
// PATH CHECKS
// ============================================================================

/// What a path handed to [`validate_onnx_path`] is supposed to point at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnnxFile {
    Runtime,
    Model,
}

/// Reject paths that are empty, relative, contain `..`, or have the wrong
/// extension for their kind. Versioned shared objects (`libonnxruntime.so.1.17.0`)
/// count as runtime libraries.
pub fn validate_onnx_path(path: &Path, kind: OnnxFile) -> Result<(), ModelError> {
    let fail = |msg: String| match kind {
        OnnxFile::Runtime => ModelError::LibraryLoadFailed(msg),
        OnnxFile::Model => ModelError::ModelLoadFailed(msg),
    };

    if path.as_os_str().is_empty() {
        return Err(fail("Path is empty".to_string()));
    }
    if !path.is_absolute() {
        return Err(fail(format!("Path must be absolute: {}", path.display())));
    }
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(fail("Path must not contain '..' components".to_string()));
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_lowercase();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match kind {
        OnnxFile::Runtime => {
            let ok = matches!(ext.as_str(), "dll" | "so" | "dylib") || file_name.contains(".so.");
            if !ok {
                return Err(fail(format!(
                    "Expected a .dll/.so/.dylib file, got '{}'",
                    file_name
                )));
            }
        }
        OnnxFile::Model => {
            if ext != "onnx" {
                return Err(fail(format!("Expected a .onnx model file, got '.{}'", ext)));
            }
        }
    }
    Ok(())
}

/// Parse a version string like "1.18.0" into (major, minor).
fn parse_ort_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split('.');
    let major: u32 = parts.next()?.trim().parse().ok()?;
    let minor: u32 = parts.next()?.trim().parse().ok()?;
    Some((major, minor))
}

fn version_supported(version: &str) -> bool {
    match parse_ort_version(version) {
        Some((major, minor)) => (major, minor) >= ORT_MIN_VERSION,
        // Unknown formats are let through; the GetApi call below still guards.
        None => true,
    }
}

// ============================================================================
// ONNX RUNTIME BACKEND
// ============================================================================

/// A loaded ONNX Runtime session for the digit classifier.
pub struct OnnxDigitModel {
    api: OrtApi,
    env: *mut OrtEnv,
    session_options: *mut OrtSessionOptions,
    session: *mut OrtSession,
    input_name: CString,
    output_name: CString,
    version: String,
    /// Serializes `Run` calls; the session is shared with the worker thread.
    run_lock: Mutex<()>,
    // Dropped last so every function pointer above stays valid in `Drop`.
    _lib: libloading::Library,
}

// SAFETY: the raw handles are only touched through the ORT C API, which
// is thread-safe for session use; `run_lock` serializes inference anyway.
unsafe impl Send for OnnxDigitModel {}
unsafe impl Sync for OnnxDigitModel {}

impl OnnxDigitModel {
    /// Load the runtime library, create the environment and a session for
    /// `model_path`. Any failure here is a startup failure.
    pub fn load(dll_path: &Path, model_path: &Path, threads: u16) -> Result<Self, ModelError> {
        validate_onnx_path(dll_path, OnnxFile::Runtime)?;
        validate_onnx_path(model_path, OnnxFile::Model)?;

        if !dll_path.exists() {
            return Err(ModelError::LibraryNotFound(dll_path.display().to_string()));
        }
        if !model_path.exists() {
            return Err(ModelError::ModelNotFound(model_path.display().to_string()));
        }

        log_info!("Loading ONNX Runtime from {}", dll_path.display());

        unsafe {
            let lib = libloading::Library::new(dll_path)
                .map_err(|e| ModelError::LibraryLoadFailed(format!("{}", e)))?;

            let (api, version) = {
                let get_api_base: libloading::Symbol<unsafe extern "C" fn() -> *const OrtApiBase> =
                    lib.get(b"OrtGetApiBase").map_err(|e| {
                        ModelError::LibraryLoadFailed(format!(
                            "Symbol OrtGetApiBase not found: {}",
                            e
                        ))
                    })?;

                let api_base = get_api_base();
                if api_base.is_null() {
                    return Err(ModelError::ApiInitFailed(
                        "OrtGetApiBase returned null".to_string(),
                    ));
                }

                let version_ptr = ((*api_base).get_version_string)();
                let version = if version_ptr.is_null() {
                    "unknown".to_string()
                } else {
                    CStr::from_ptr(version_ptr).to_string_lossy().into_owned()
                };
                if !version_supported(&version) {
                    let (min_major, min_minor) = ORT_MIN_VERSION;
                    return Err(ModelError::ApiInitFailed(format!(
                        "ONNX Runtime {} is too old, need {}.{} or newer",
                        version, min_major, min_minor
                    )));
                }

                let api_ptr = ((*api_base).get_api)(ORT_API_VERSION);
                if api_ptr.is_null() {
                    return Err(ModelError::ApiInitFailed(format!(
                        "OrtGetApi({}) returned null; runtime {} may be too old",
                        ORT_API_VERSION, version
                    )));
                }
                (OrtApi { raw: api_ptr }, version)
            };
            log_info!("ONNX Runtime {} loaded", version);

            let mut env: *mut OrtEnv = std::ptr::null_mut();
            let log_id = CString::new("DigitPad").unwrap_or_default();
            status_to_result(
                &api,
                (api.create_env())(OrtLoggingLevel::Warning, log_id.as_ptr(), &mut env),
            )
            .map_err(ModelError::ApiInitFailed)?;

            let mut session_options: *mut OrtSessionOptions = std::ptr::null_mut();
            if let Err(e) =
                status_to_result(&api, (api.create_session_options())(&mut session_options))
            {
                (api.release_env())(env);
                return Err(ModelError::SessionCreateFailed(e));
            }
            let _ = status_to_result(
                &api,
                (api.set_intra_op_num_threads())(session_options, threads.max(1) as i32),
            );
            let _ = status_to_result(
                &api,
                (api.set_session_graph_optimization_level())(
                    session_options,
                    GRAPH_OPTIMIZATION_ALL,
                ),
            );

            let mut session: *mut OrtSession = std::ptr::null_mut();
            let create_status = create_session(&api, env, model_path, session_options, &mut session);
            if let Err(e) = create_status {
                (api.release_session_options())(session_options);
                (api.release_env())(env);
                return Err(ModelError::ModelLoadFailed(e));
            }

            // From here on `Drop` owns the cleanup.
            let mut model = OnnxDigitModel {
                api,
                env,
                session_options,
                session,
                input_name: CString::default(),
                output_name: CString::default(),
                version,
                run_lock: Mutex::new(()),
                _lib: lib,
            };
            model.resolve_io_names()?;
            log_info!(
                "Model {} ready (input '{}', output '{}')",
                model_path.display(),
                model.input_name.to_string_lossy(),
                model.output_name.to_string_lossy()
            );
            Ok(model)
        }
    }

    pub fn runtime_version(&self) -> &str {
        &self.version
    }

    /// Look up the first input and first output tensor names.
    unsafe fn resolve_io_names(&mut self) -> Result<(), ModelError> {
        let api = &self.api;
        let mut allocator: *mut OrtAllocator = std::ptr::null_mut();
        status_to_result(api, (api.get_allocator_with_default_options())(&mut allocator))
            .map_err(|e| ModelError::SessionCreateFailed(format!("Get allocator: {}", e)))?;

        let mut inputs: usize = 0;
        status_to_result(api, (api.session_get_input_count())(self.session, &mut inputs))
            .map_err(|e| ModelError::SessionCreateFailed(format!("Get input count: {}", e)))?;
        let mut outputs: usize = 0;
        status_to_result(api, (api.session_get_output_count())(self.session, &mut outputs))
            .map_err(|e| ModelError::SessionCreateFailed(format!("Get output count: {}", e)))?;
        if inputs == 0 || outputs == 0 {
            return Err(ModelError::SessionCreateFailed(format!(
                "Model has {} input(s) and {} output(s); need at least one of each",
                inputs, outputs
            )));
        }
        if outputs > 1 {
            log_warn!("Model has {} outputs, using the first", outputs);
        }

        let input = session_name(api, api.session_get_input_name(), self.session, allocator, "input")?;
        let output =
            session_name(api, api.session_get_output_name(), self.session, allocator, "output")?;
        self.input_name = CString::new(input)
            .map_err(|e| ModelError::SessionCreateFailed(format!("Input name: {}", e)))?;
        self.output_name = CString::new(output)
            .map_err(|e| ModelError::SessionCreateFailed(format!("Output name: {}", e)))?;
        Ok(())
    }

    unsafe fn run_session(&self, input: &ModelInput) -> Result<Vec<f32>, ModelError> {
        let api = &self.api;

        let mut memory_info: *mut OrtMemoryInfo = std::ptr::null_mut();
        status_to_result(
            api,
            (api.create_cpu_memory_info())(
                OrtAllocatorType::ArenaAllocator,
                OrtMemType::Default,
                &mut memory_info,
            ),
        )
        .map_err(|e| ModelError::InferenceFailed(format!("Create memory info: {}", e)))?;
        let _memory_info = Owned::new(memory_info, api.release_memory_info());

        // ORT borrows this buffer for the lifetime of the input value.
        let mut tensor_data = input.data.clone();
        let mut input_tensor: *mut OrtValue = std::ptr::null_mut();
        status_to_result(
            api,
            (api.create_tensor_with_data())(
                memory_info,
                tensor_data.as_mut_ptr() as *mut c_void,
                tensor_data.len() * std::mem::size_of::<f32>(),
                input.shape.as_ptr(),
                input.shape.len(),
                ONNXTensorElementDataType::Float,
                &mut input_tensor,
            ),
        )
        .map_err(|e| ModelError::InferenceFailed(format!("Create input tensor: {}", e)))?;
        let _input_tensor = Owned::new(input_tensor, api.release_value());

        let input_names = [self.input_name.as_ptr()];
        let output_names = [self.output_name.as_ptr()];
        let inputs = [input_tensor as *const OrtValue];
        let mut output: *mut OrtValue = std::ptr::null_mut();

        status_to_result(
            api,
            (api.run())(
                self.session,
                std::ptr::null(),
                input_names.as_ptr(),
                inputs.as_ptr(),
                1,
                output_names.as_ptr(),
                1,
                &mut output,
            ),
        )
        .map_err(ModelError::InferenceFailed)?;
        if output.is_null() {
            return Err(ModelError::InvalidOutput("Run produced no output".to_string()));
        }
        let _output = Owned::new(output, api.release_value());

        let count = self.element_count(output)?;
        let mut data_ptr: *mut c_void = std::ptr::null_mut();
        status_to_result(api, (api.get_tensor_mutable_data())(output, &mut data_ptr))
            .map_err(|e| ModelError::InvalidOutput(format!("Get tensor data: {}", e)))?;
        if data_ptr.is_null() {
            return Err(ModelError::InvalidOutput("Output tensor has no data".to_string()));
        }
        Ok(std::slice::from_raw_parts(data_ptr as *const f32, count).to_vec())
    }

    /// Total number of elements in an output tensor.
    unsafe fn element_count(&self, value: *mut OrtValue) -> Result<usize, ModelError> {
        let api = &self.api;
        let mut info: *mut OrtTensorTypeAndShapeInfo = std::ptr::null_mut();
        status_to_result(api, (api.get_tensor_type_and_shape())(value, &mut info))
            .map_err(|e| ModelError::InvalidOutput(format!("Get output shape: {}", e)))?;
        let _info = Owned::new(info, api.release_tensor_type_and_shape_info());

        let mut dim_count: usize = 0;
        status_to_result(api, (api.get_dimensions_count())(info, &mut dim_count))
            .map_err(|e| ModelError::InvalidOutput(format!("Get dimension count: {}", e)))?;
        let mut dims = vec![0i64; dim_count];
        status_to_result(api, (api.get_dimensions())(info, dims.as_mut_ptr(), dim_count))
            .map_err(|e| ModelError::InvalidOutput(format!("Get dimensions: {}", e)))?;

        if dims.iter().any(|&d| d < 0) {
            return Err(ModelError::InvalidOutput(format!(
                "Output has unresolved dimensions {:?}",
                dims
            )));
        }
        Ok(dims.iter().product::<i64>() as usize)
    }
}

impl DigitModel for OnnxDigitModel {
    fn predict(&self, input: &ModelInput) -> Result<Vec<f32>, ModelError> {
        if input.data.len() != input.element_count() {
            return Err(ModelError::InvalidInput(format!(
                "{} values for shape {:?}",
                input.data.len(),
                input.shape
            )));
        }
        let _guard = self
            .run_lock
            .lock()
            .map_err(|_| ModelError::InferenceFailed("Session lock poisoned".to_string()))?;
        unsafe { self.run_session(input) }
    }
}

impl Drop for OnnxDigitModel {
    fn drop(&mut self) {
        unsafe {
            (self.api.release_session())(self.session);
            (self.api.release_session_options())(self.session_options);
            (self.api.release_env())(self.env);
        }
    }
}

/// Releases an ORT handle when it goes out of scope.
struct Owned<T> {
    ptr: *mut T,
    release: unsafe extern "C" fn(*mut T),
}

impl<T> Owned<T> {
    fn new(ptr: *mut T, release: unsafe extern "C" fn(*mut T)) -> Self {
        Self { ptr, release }
    }
}

impl<T> Drop for Owned<T> {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { (self.release)(self.ptr) }
        }
    }
}

#[cfg(windows)]
unsafe fn create_session(
    api: &OrtApi,
    env: *mut OrtEnv,
    model_path: &Path,
    options: *mut OrtSessionOptions,
    out: *mut *mut OrtSession,
) -> Result<(), String> {
    use std::os::windows::ffi::OsStrExt;
    let wide: Vec<u16> = model_path
        .as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();
    status_to_result(api, (api.create_session())(env, wide.as_ptr(), options, out))
}

#[cfg(not(windows))]
unsafe fn create_session(
    api: &OrtApi,
    env: *mut OrtEnv,
    model_path: &Path,
    options: *mut OrtSessionOptions,
    out: *mut *mut OrtSession,
) -> Result<(), String> {
    let path = model_path
        .to_str()
        .ok_or_else(|| "Model path is not valid UTF-8".to_string())?;
    let narrow = CString::new(path).map_err(|e| e.to_string())?;
    status_to_result(api, (api.create_session())(env, narrow.as_ptr(), options, out))
}

/// Fetch a tensor name from the session and free the ORT-owned copy.
unsafe fn session_name(
    api: &OrtApi,
    getter: SessionGetNameFn,
    session: *mut OrtSession,
    allocator: *mut OrtAllocator,
    fallback: &str,
) -> Result<String, ModelError> {
    let mut name_ptr: *mut c_char = std::ptr::null_mut();
    status_to_result(api, getter(session, 0, allocator, &mut name_ptr))
        .map_err(|e| ModelError::SessionCreateFailed(format!("Get {} name: {}", fallback, e)))?;

    if name_ptr.is_null() {
        return Ok(fallback.to_string());
    }
    let name = CStr::from_ptr(name_ptr).to_string_lossy().into_owned();
    let _ = status_to_result(api, (api.allocator_free())(allocator, name_ptr as *mut c_void));
    Ok(name)
}
