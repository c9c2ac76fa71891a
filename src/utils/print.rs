//! Helper macros for logging (console printing).

/// Log TRACE message.
///
/// Example:
/// ```no_run
/// pf_trace!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($fmt_str:literal) => {
        log::trace!($fmt_str)
    };

    ($fmt_str:literal, $($fmt_arg:tt)*) => {
        log::trace!($fmt_str, $($fmt_arg)*)
    };
}

/// Log DEBUG message.
///
/// Example:
/// ```no_run
/// pf_debug!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_debug {
    ($fmt_str:literal) => {
        log::debug!($fmt_str)
    };

    ($fmt_str:literal, $($fmt_arg:tt)*) => {
        log::debug!($fmt_str, $($fmt_arg)*)
    };
}

/// Log INFO message.
///
/// Example:
/// ```no_run
/// pf_info!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_info {
    ($fmt_str:literal) => {
        log::info!($fmt_str)
    };

    ($fmt_str:literal, $($fmt_arg:tt)*) => {
        log::info!($fmt_str, $($fmt_arg)*)
    };
}

/// Log WARN message.
///
/// Example:
/// ```no_run
/// pf_warn!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_warn {
    ($fmt_str:literal) => {
        log::warn!($fmt_str)
    };

    ($fmt_str:literal, $($fmt_arg:tt)*) => {
        log::warn!($fmt_str, $($fmt_arg)*)
    };
}

/// Log ERROR message.
///
/// Example:
/// ```no_run
/// pf_error!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_error {
    ($fmt_str:literal) => {
        log::error!($fmt_str)
    };

    ($fmt_str:literal, $($fmt_arg:tt)*) => {
        log::error!($fmt_str, $($fmt_arg)*)
    };
}

/// Log an error string to logger and then return a `TraftError`
/// containing the string.
///
/// Example:
/// ```no_run
/// let e = logged_err!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($fmt_str:literal) => {
        {
            pf_error!($fmt_str);
            Err($crate::utils::TraftError($fmt_str.into()))
        }
    };

    ($fmt_str:literal, $($fmt_arg:tt)*) => {
        {
            pf_error!($fmt_str, $($fmt_arg)*);
            Err($crate::utils::TraftError(format!($fmt_str, $($fmt_arg)*)))
        }
    };
}
