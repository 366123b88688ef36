//! Shell command actions.
//!
//! [`ShellAction::into_action`] turns a command line into a job action that
//! expands parameters into its arguments, exports them as environment
//! variables, and streams stdout and stderr into the invocation output.

mod action;
pub mod expand;

pub use action::ShellAction;
