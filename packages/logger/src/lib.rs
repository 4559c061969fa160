//! Simple to ``stderr`` logger.
//!
//! `trace`, `debug` and `info` lines are only emitted when this crate is built
//! with the `debug` feature; `warn` and `error` are always emitted.

/// Timestamp related functions.
///
/// This module is used by the exported macros in external crates; so this has
/// to be public in scope.
#[cfg(feature = "debug")]
pub mod timestamp {
    use chrono::Utc;

    /// Generate the current timestamp.
    pub fn now() -> String {
        Utc::now().to_rfc3339()
    }
}

#[doc(hidden)]
#[cfg(feature = "debug")]
#[macro_export]
macro_rules! __prefix {
    ($label:literal) => {
        format!("{} {}", $crate::timestamp::now(), $label)
    };
}

#[doc(hidden)]
#[cfg(not(feature = "debug"))]
#[macro_export]
macro_rules! __prefix {
    ($label:literal) => {
        $label
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __emit {
    ($label:literal, $colour:literal, $($arg:tt)*) => {
        eprintln!(
            concat!("\x1b[1m\x1b[38:5:", $colour, "m{}\x1b[39m | \x1b[22m{}"),
            $crate::__prefix!($label),
            format_args!($($arg)*)
        )
    };
}

/// Type-check the arguments without printing anything.
#[doc(hidden)]
#[macro_export]
macro_rules! __silent {
    ($($arg:tt)*) => {{
        if false {
            let _ = format!($($arg)*);
        }
    }};
}

#[cfg(feature = "debug")]
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {{
        $crate::__emit!("TRACE", "240", $($arg)*)
    }};
}

#[cfg(not(feature = "debug"))]
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::__silent!($($arg)*)
    };
}

#[cfg(feature = "debug")]
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {{
        $crate::__emit!("DEBUG", "245", $($arg)*)
    }};
}

#[cfg(not(feature = "debug"))]
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::__silent!($($arg)*)
    };
}

#[cfg(feature = "debug")]
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {{
        $crate::__emit!("INFO ", "15", $($arg)*)
    }};
}

#[cfg(not(feature = "debug"))]
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::__silent!($($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {{
        $crate::__emit!("WARN ", "11", $($arg)*)
    }};
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {{
        $crate::__emit!("ERROR", "9", $($arg)*)
    }};
}
