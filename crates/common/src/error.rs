//! Helpers for attaching context to crate-local errors.

/// Error types that can be built from a plain message.
///
/// Crates implement this for their own `Error` and then call
/// [`impl_context!`] inside their error module.
pub trait FromMessage: Sized {
    fn from_message(message: String) -> Self;
}

/// Prefix `source` with `context` the way every `Context` impl formats it.
#[doc(hidden)]
pub fn contextualize(context: &str, source: &dyn std::fmt::Display) -> String {
    format!("{context}: {source}")
}

/// Generate a crate-local `Context` trait adding `.context()` and
/// `.with_context()` to `Result` and `Option`.
///
/// The calling module must define `Error: FromMessage` and
/// `type Result<T> = std::result::Result<T, Error>`.
///
/// ```ignore
/// // crates/config/src/error.rs
/// jobkit_common::impl_context!();
/// ```
#[macro_export]
macro_rules! impl_context {
    () => {
        pub trait Context<T> {
            fn context(self, context: impl Into<String>) -> Result<T>;
            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C;
        }

        impl<T, E: std::fmt::Display> Context<T> for std::result::Result<T, E> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                let context = context.into();
                self.map_err(|source| {
                    <Error as $crate::FromMessage>::from_message($crate::error::contextualize(
                        &context, &source,
                    ))
                })
            }

            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.map_err(|source| {
                    <Error as $crate::FromMessage>::from_message($crate::error::contextualize(
                        &f().into(),
                        &source,
                    ))
                })
            }
        }

        impl<T> Context<T> for Option<T> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                self.ok_or_else(|| <Error as $crate::FromMessage>::from_message(context.into()))
            }

            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.ok_or_else(|| <Error as $crate::FromMessage>::from_message(f().into()))
            }
        }
    };
}
