use core::fmt;

/// Shorthand for `core::result::Result` specialized to [`KernelError`].
pub type Result<T = ()> = core::result::Result<T, KernelError>;

macro_rules! define_kernel_error {
    (
        $( #[doc = $enum_doc:literal] )*
        $vis:vis enum $Name:ident {
            $(
                $( #[doc = $doc:literal] )*
                $Variant:ident = $code:literal => $desc:literal,
            )*
        }
    ) => {
        $( #[doc = $enum_doc] )*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(i32)]
        #[non_exhaustive]
        $vis enum $Name {
            $(
                $( #[doc = $doc] )*
                $Variant = $code,
            )*
        }

        impl $Name {
            /// The negative numeric code used on the syscall ABI.
            #[inline]
            pub const fn code(self) -> i32 {
                -(self as i32)
            }

            /// A short diagnostic string, used by the panic path.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $( Self::$Variant => $desc, )*
                }
            }

            /// Recover an error from a negative syscall return value.
            pub const fn from_code(code: i32) -> Self {
                match -code {
                    $( $code => Self::$Variant, )*
                    _ => Self::Unknown,
                }
            }
        }
    };
}

define_kernel_error! {
    /// Every error the kernel can report. The names are the contract; the
    /// numeric values back the negative syscall return codes.
    pub enum KernelError {
        /// Unspecified failure, including operations on a dead or invalid
        /// object id.
        Fail = 1 => "unspecified failure",
        /// The ready set is empty and no task can be elected.
        NoTasks = 2 => "no runnable tasks",
        KcbAlloc = 3 => "kernel control block allocation failed",
        TcbAlloc = 4 => "task control block allocation failed",
        StackAlloc = 5 => "task stack allocation failed",
        /// The task cannot be removed (it is the caller, or it is running).
        TaskCantRemove = 6 => "task cannot be removed",
        TaskNotFound = 7 => "no such task",
        TaskCantSuspend = 8 => "task cannot be suspended",
        TaskCantResume = 9 => "task is not suspended",
        TaskInvalidPrio = 10 => "invalid task priority",
        TaskInvalidEntry = 11 => "invalid task entry point",
        /// Expected non-success: the resource is unavailable or busy.
        TaskBusy = 12 => "resource busy",
        NotOwner = 13 => "caller does not own the object",
        /// A stack guard word was overwritten.
        StackCheck = 14 => "stack check failed",
        PipeAlloc = 15 => "pipe allocation failed",
        PipeDealloc = 16 => "pipe deallocation failed",
        SemAlloc = 17 => "semaphore allocation failed",
        SemDealloc = 18 => "semaphore deallocation failed",
        SemOperation = 19 => "invalid semaphore operation",
        MqNotEmpty = 20 => "message queue not empty",
        /// Expected non-success: a timed wait expired.
        Timeout = 21 => "operation timed out",
        Unknown = 22 => "unknown error",
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
