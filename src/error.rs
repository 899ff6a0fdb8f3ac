use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// This enum covers the failure modes of snapshot parsing, instruction decoding and the
/// optimization pipeline. Structural contract violations (a jump target that does not land on
/// a decoded instruction, passes run out of order) are *not* represented here: those indicate
/// a bug in the producing compiler or in pass sequencing and abort via assertion instead.
///
/// # Error Categories
///
/// ## Input Parsing Errors
/// - [`Error::Malformed`] - Corrupted or invalid snapshot/bytecode structure
/// - [`Error::OutOfBounds`] - Attempted to read beyond the input boundaries
/// - [`Error::NotSupported`] - Unsupported container version or feature
/// - [`Error::Empty`] - Empty input provided
///
/// ## I/O Errors
/// - [`Error::FileError`] - Filesystem I/O errors
///
/// ## Pipeline Errors
/// - [`Error::RegisterPressure`] - Linear-scan allocation exceeded the register budget
///
/// # Examples
///
/// ```rust,no_run
/// use bytepress::{Error, Snapshot};
/// use std::path::Path;
///
/// match Snapshot::open(Path::new("program.snapshot")) {
///     Ok(snapshot) => println!("Loaded {} functions", snapshot.functions().len()),
///     Err(Error::Malformed { message, file, line }) => {
///         eprintln!("Malformed snapshot: {} ({}:{})", message, file, line);
///     }
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The input is damaged and could not be parsed.
    ///
    /// This error indicates that the snapshot or bytecode structure does not conform to
    /// the expected format. The error includes the source location where the malformation
    /// was detected for debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing the input.
    ///
    /// This error occurs when trying to read data beyond the end of the snapshot
    /// buffer. It's a safety check to prevent buffer overruns during parsing.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// This container version or feature is not supported.
    #[error("This snapshot version or feature is not supported")]
    NotSupported,

    /// Provided input was empty.
    ///
    /// This error occurs when an empty file or buffer is provided where
    /// actual snapshot data was expected.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    ///
    /// Wraps standard I/O errors that can occur during file operations
    /// such as reading from disk, permission issues, or filesystem errors.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Linear-scan allocation ran out of registers.
    ///
    /// Raised when expiring old intervals cannot free a slot and the active set already
    /// fills the register budget. With the default budget (the function's original
    /// register count) this is unreachable, because a single register's intervals never
    /// overlap each other; it can only fire when a caller requests a smaller budget.
    #[error("Register pressure: {needed} live intervals, budget of {available}")]
    RegisterPressure {
        /// Number of simultaneously live intervals at the point of failure
        needed: usize,
        /// The register budget the allocator was given
        available: usize,
    },

    /// Generic error for miscellaneous failures.
    ///
    /// Used for errors that don't fit into other categories or for
    /// wrapping external failures with additional context.
    #[error("{0}")]
    Error(String),
}
