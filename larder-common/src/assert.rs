// Copyright 2026 larder Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// Report a broken invariant and abort the current thread of control.
///
/// The diagnostic is logged at `error` level before panicking, so it reaches the log sink even
/// when the panic is swallowed by a supervisor.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        $crate::__tracing::error!("[fatal]: {msg}");
        panic!("{}", msg);
    }};
}

/// Like `assert!`, but routes the failure through [`fatal!`].
///
/// Always enabled, regardless of build profile.
#[macro_export]
macro_rules! fatal_assert {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::fatal!("invariant violated: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::fatal!($($arg)+);
        }
    };
}

/// Use `debug_assert!` by default. Use `assert!` when feature "strict_assertions" is enabled.
#[macro_export]
macro_rules! strict_assert {
    ($($arg:tt)*) => {
        #[cfg(feature = "strict_assertions")]
        assert!($($arg)*);
        #[cfg(not(feature = "strict_assertions"))]
        debug_assert!($($arg)*);
    }
}

/// Use `debug_assert_eq!` by default. Use `assert_eq!` when feature "strict_assertions" is enabled.
#[macro_export]
macro_rules! strict_assert_eq {
    ($($arg:tt)*) => {
        #[cfg(feature = "strict_assertions")]
        assert_eq!($($arg)*);
        #[cfg(not(feature = "strict_assertions"))]
        debug_assert_eq!($($arg)*);
    }
}

#[cfg(test)]
mod tests {
    #[test_log::test]
    fn test_fatal_assert_passes() {
        let size = 10usize;
        fatal_assert!(size >= 3, "size underflow: {size} < 3");
        fatal_assert!(size > 0);
    }

    #[test_log::test]
    #[should_panic(expected = "size underflow: 2 < 3")]
    fn test_fatal_assert_panics_with_message() {
        let size = 2usize;
        fatal_assert!(size >= 3, "size underflow: {size} < 3");
    }

    #[test_log::test]
    #[should_panic(expected = "invariant violated")]
    fn test_fatal_assert_default_message() {
        fatal_assert!(1 + 1 == 3);
    }
}
