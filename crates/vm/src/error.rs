//! Error types for the Babe VM core.
//!
//! Two failure currencies flow through the VM: language-level throwables,
//! carried by handle so they can cross any number of host frames, and fatal
//! VM errors that unwind to the outermost exit frame with a stable numeric
//! exit code.

use crate::cell::Ref;
use thiserror::Error;

/// Result alias used across the VM core.
pub type VmResult<T> = Result<T, VmError>;

/// Errors building a VM from process options.
#[derive(Error, Debug)]
pub enum BootError {
    /// An option failed its bounds validation
    #[error("configuration: {0}")]
    Config(#[from] bvm_config::ConfigError),

    /// Bootstrap itself failed fatally
    #[error("bootstrap: {0}")]
    Vm(#[from] VmError),
}

/// Stable numeric exit codes for fatal VM termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Normal termination
    Success = 0,
    /// An exception escaped the bootstrap thread's uncaught handler
    UncaughtException = 1,
    /// The heap could not satisfy an allocation even after collection
    OutOfMemory = 2,
    /// Debug builds only: live chunks remained at shutdown
    HeapLeak = 3,
    /// A chunk failed a structural validity check
    InvalidChunk = 4,
    /// More classpath entries than the configured maximum
    ClasspathExceeded = 5,
    /// The scheduler found no runnable and no waiting threads
    NoRunnableThreads = 6,
    /// The transient GC-root stack overflowed
    TransientRootsExhausted = 7,
    /// The permanent GC-root stack overflowed
    PermanentRootsExhausted = 8,
    /// An archive member failed to inflate
    InflateFailure = 9,
    /// An archive member used an unsupported compression method
    UnknownCompression = 10,
    /// A platform primitive type had an unexpected size
    PlatformTypeSize = 11,
}

impl ExitCode {
    /// The process exit code value.
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// The throwable taxonomy the core can raise from host code.
///
/// The class library behind each kind is loaded by the external class
/// loader; the core only needs the name to build (or pre-build) an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThrowableKind {
    NullPointerException,
    ArrayIndexOutOfBoundsException,
    ArrayStoreException,
    NegativeArraySizeException,
    ClassCastException,
    ArithmeticException,
    IllegalArgumentException,
    IllegalMonitorStateException,
    IllegalThreadStateException,
    InterruptedException,
    NoSuchMethodError,
    NoSuchFieldError,
    IncompatibleClassChangeError,
    LinkageError,
    ClassNotFoundException,
    InstantiationException,
    InstantiationError,
    IllegalAccessException,
    IllegalAccessError,
    CloneNotSupportedException,
    StackOverflowError,
    OutOfMemoryError,
    VirtualMachineError,
    IoException,
    FileNotFoundException,
    UnsupportedOperationException,
}

impl ThrowableKind {
    /// The internal (slash-separated) class name for this kind.
    pub fn class_name(self) -> &'static str {
        match self {
            Self::NullPointerException => "java/lang/NullPointerException",
            Self::ArrayIndexOutOfBoundsException => "java/lang/ArrayIndexOutOfBoundsException",
            Self::ArrayStoreException => "java/lang/ArrayStoreException",
            Self::NegativeArraySizeException => "java/lang/NegativeArraySizeException",
            Self::ClassCastException => "java/lang/ClassCastException",
            Self::ArithmeticException => "java/lang/ArithmeticException",
            Self::IllegalArgumentException => "java/lang/IllegalArgumentException",
            Self::IllegalMonitorStateException => "java/lang/IllegalMonitorStateException",
            Self::IllegalThreadStateException => "java/lang/IllegalThreadStateException",
            Self::InterruptedException => "java/lang/InterruptedException",
            Self::NoSuchMethodError => "java/lang/NoSuchMethodError",
            Self::NoSuchFieldError => "java/lang/NoSuchFieldError",
            Self::IncompatibleClassChangeError => "java/lang/IncompatibleClassChangeError",
            Self::LinkageError => "java/lang/LinkageError",
            Self::ClassNotFoundException => "java/lang/ClassNotFoundException",
            Self::InstantiationException => "java/lang/InstantiationException",
            Self::InstantiationError => "java/lang/InstantiationError",
            Self::IllegalAccessException => "java/lang/IllegalAccessException",
            Self::IllegalAccessError => "java/lang/IllegalAccessError",
            Self::CloneNotSupportedException => "java/lang/CloneNotSupportedException",
            Self::StackOverflowError => "java/lang/StackOverflowError",
            Self::OutOfMemoryError => "java/lang/OutOfMemoryError",
            Self::VirtualMachineError => "java/lang/VirtualMachineError",
            Self::IoException => "java/io/IOException",
            Self::FileNotFoundException => "java/io/FileNotFoundException",
            Self::UnsupportedOperationException => "java/lang/UnsupportedOperationException",
        }
    }

    /// All kinds, in a stable order, for bootstrap registration.
    pub fn all() -> &'static [ThrowableKind] {
        &[
            Self::NullPointerException,
            Self::ArrayIndexOutOfBoundsException,
            Self::ArrayStoreException,
            Self::NegativeArraySizeException,
            Self::ClassCastException,
            Self::ArithmeticException,
            Self::IllegalArgumentException,
            Self::IllegalMonitorStateException,
            Self::IllegalThreadStateException,
            Self::InterruptedException,
            Self::NoSuchMethodError,
            Self::NoSuchFieldError,
            Self::IncompatibleClassChangeError,
            Self::LinkageError,
            Self::ClassNotFoundException,
            Self::InstantiationException,
            Self::InstantiationError,
            Self::IllegalAccessException,
            Self::IllegalAccessError,
            Self::CloneNotSupportedException,
            Self::StackOverflowError,
            Self::OutOfMemoryError,
            Self::VirtualMachineError,
            Self::IoException,
            Self::FileNotFoundException,
            Self::UnsupportedOperationException,
        ]
    }
}

/// VM core errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// A language-level throwable in flight; `object` is the arena handle of
    /// the throwable instance. Unwinds to the nearest try frame.
    #[error("throwable in flight: {kind:?}")]
    Throw {
        /// The throwable instance
        object: Ref,
        /// The kind, when the throwable was raised by the core itself
        kind: Option<ThrowableKind>,
    },

    /// A fatal VM error; unwinds to the outermost exit frame.
    #[error("fatal VM error {code:?}: {message}")]
    Exit {
        /// The process exit code
        code: ExitCode,
        /// Human-readable context for the console
        message: String,
    },
}

impl VmError {
    /// Raises a throwable by handle.
    pub fn throw(object: Ref) -> Self {
        Self::Throw { object, kind: None }
    }

    /// Raises a throwable by handle, tagged with the kind the core raised.
    pub fn throw_kind(object: Ref, kind: ThrowableKind) -> Self {
        Self::Throw {
            object,
            kind: Some(kind),
        }
    }

    /// Raises a fatal VM error.
    pub fn exit(code: ExitCode, message: impl Into<String>) -> Self {
        Self::Exit {
            code,
            message: message.into(),
        }
    }

    /// Returns the throwable handle when this is a language-level throw.
    pub fn thrown_object(&self) -> Option<Ref> {
        match self {
            Self::Throw { object, .. } => Some(*object),
            Self::Exit { .. } => None,
        }
    }

    /// Returns the kind when the core raised this throwable itself.
    pub fn thrown_kind(&self) -> Option<ThrowableKind> {
        match self {
            Self::Throw { kind, .. } => *kind,
            Self::Exit { .. } => None,
        }
    }
}
