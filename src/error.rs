//! Error types for WMI Bridge

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Raw status code returned by the instrumentation provider.
///
/// Rendered the way Windows tooling prints an HRESULT: `0x` followed by
/// eight lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HResult(pub i32);

impl HResult {
    /// Generic failure (`E_FAIL`)
    pub const E_FAIL: HResult = HResult(0x8000_4005_u32 as i32);
    /// Interface not supported (`E_NOINTERFACE`)
    pub const E_NOINTERFACE: HResult = HResult(0x8000_4002_u32 as i32);
    /// Unspecified provider failure (`WBEM_E_FAILED`)
    pub const WBEM_E_FAILED: HResult = HResult(0x8004_1001_u32 as i32);
    /// Object could not be found (`WBEM_E_NOT_FOUND`)
    pub const WBEM_E_NOT_FOUND: HResult = HResult(0x8004_1002_u32 as i32);
    /// Namespace does not exist (`WBEM_E_INVALID_NAMESPACE`)
    pub const WBEM_E_INVALID_NAMESPACE: HResult = HResult(0x8004_100E_u32 as i32);
    /// Class does not exist (`WBEM_E_INVALID_CLASS`)
    pub const WBEM_E_INVALID_CLASS: HResult = HResult(0x8004_1010_u32 as i32);
    /// Query text is malformed (`WBEM_E_INVALID_QUERY`)
    pub const WBEM_E_INVALID_QUERY: HResult = HResult(0x8004_1017_u32 as i32);

    /// True for failure codes (severity bit set)
    pub fn is_failure(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for HResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0 as u32)
    }
}

/// Stage of the session bootstrap sequence that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootstrapStage {
    /// COM library initialization
    Initialize,
    /// Process-wide security levels
    Security,
    /// Creation of the WMI locator
    Locator,
    /// Connection to the root namespace
    Connect,
    /// Security blanket on the service proxy
    ProxyBlanket,
}

impl fmt::Display for BootstrapStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialize => write!(f, "Failed to initialize COM library"),
            Self::Security => write!(f, "Failed to initialize security"),
            Self::Locator => write!(f, "Failed to create IWbemLocator object"),
            Self::Connect => write!(f, "Could not connect to namespace"),
            Self::ProxyBlanket => write!(f, "Could not set proxy blanket"),
        }
    }
}

/// A failed bootstrap step, as reported by a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapFailure {
    pub stage: BootstrapStage,
    pub code: HResult,
}

impl BootstrapFailure {
    pub fn new(stage: BootstrapStage, code: HResult) -> Self {
        Self { stage, code }
    }
}

/// Main error type for WMI Bridge
#[derive(Error, Debug)]
pub enum Error {
    /// Session could not be established; unrecoverable
    #[error("{stage}. Error code = {code}")]
    Bootstrap { stage: BootstrapStage, code: HResult },

    /// Sub-namespace could not be opened
    #[error("Query for namespace {namespace} failed. Error code = {code}")]
    Namespace { namespace: String, code: HResult },

    /// Synchronous query submission failed
    #[error("Query \"{query}\" failed. Error code = {code}")]
    Query { query: String, code: HResult },

    /// The unsecured apartment could not be created
    #[error("Failed to create unsecured apartment. Error code = {code}")]
    StubFactory { code: HResult },

    /// The event sink could not be wrapped in an object stub
    #[error("Failed to create object stub for event sink. Error code = {code}")]
    StubCreation { code: HResult },

    /// Asynchronous notification query registration failed
    #[error("ExecNotificationQueryAsync failed for \"{query}\". Error code = {code}")]
    Registration { query: String, code: HResult },

    /// Property names of an object could not be enumerated
    #[error("Failed to enumerate property names. Error code = {code}")]
    PropertyNames { code: HResult },

    /// Malformed namespace-qualified class name
    #[error("Invalid class name: {0}")]
    InvalidName(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Unsupported platform
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<BootstrapFailure> for Error {
    fn from(failure: BootstrapFailure) -> Self {
        Error::Bootstrap {
            stage: failure.stage,
            code: failure.code,
        }
    }
}

impl Error {
    /// Provider status code carried by this error, if any
    pub fn code(&self) -> Option<HResult> {
        match self {
            Error::Bootstrap { code, .. }
            | Error::Namespace { code, .. }
            | Error::Query { code, .. }
            | Error::StubFactory { code }
            | Error::StubCreation { code }
            | Error::Registration { code, .. }
            | Error::PropertyNames { code } => Some(*code),
            _ => None,
        }
    }

    /// True when no other operation can proceed after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Bootstrap { .. })
    }
}
