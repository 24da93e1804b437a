//! Helper macros for logging (console printing).

/// Log TRACE message.
///
/// Example:
/// ```ignore
/// pf_trace!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($fmt_str:literal $(, $($fmt_arg:tt)*)?) => {
        log::trace!($fmt_str $(, $($fmt_arg)*)?)
    };
}

/// Log DEBUG message.
///
/// Example:
/// ```ignore
/// pf_debug!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_debug {
    ($fmt_str:literal $(, $($fmt_arg:tt)*)?) => {
        log::debug!($fmt_str $(, $($fmt_arg)*)?)
    };
}

/// Log INFO message.
///
/// Example:
/// ```ignore
/// pf_info!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_info {
    ($fmt_str:literal $(, $($fmt_arg:tt)*)?) => {
        log::info!($fmt_str $(, $($fmt_arg)*)?)
    };
}

/// Log WARN message.
///
/// Example:
/// ```ignore
/// pf_warn!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_warn {
    ($fmt_str:literal $(, $($fmt_arg:tt)*)?) => {
        log::warn!($fmt_str $(, $($fmt_arg)*)?)
    };
}

/// Log ERROR message.
///
/// Example:
/// ```ignore
/// pf_error!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_error {
    ($fmt_str:literal $(, $($fmt_arg:tt)*)?) => {
        log::error!($fmt_str $(, $($fmt_arg)*)?)
    };
}

/// Log an error string to logger and then return a `TaskboardError`
/// containing the string.
///
/// Example:
/// ```ignore
/// let e = logged_err!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($fmt_str:literal $(, $($fmt_arg:tt)*)?) => {{
        $crate::pf_error!($fmt_str $(, $($fmt_arg)*)?);
        Err($crate::TaskboardError(format!(
            $fmt_str $(, $($fmt_arg)*)?
        )))
    }};
}

#[cfg(test)]
mod tests {
    use crate::utils::TaskboardError;

    #[test]
    fn error_no_args() {
        assert_eq!(
            logged_err!("interesting message"),
            Err::<(), TaskboardError>(TaskboardError(
                "interesting message".into()
            ))
        );
    }

    #[test]
    fn error_with_args() {
        assert_eq!(
            logged_err!("got {} to print", 777),
            Err::<(), TaskboardError>(TaskboardError(
                "got 777 to print".into()
            ))
        );
    }
}
