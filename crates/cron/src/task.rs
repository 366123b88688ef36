//! Running futures on their own task so a panic becomes an error value.

use std::{any::Any, future::Future, panic::AssertUnwindSafe};

use {futures::FutureExt, tokio::task::JoinError};

/// Spawn `fut` and wait for it. A panic inside it is returned as
/// `Err("panic: <message>")` instead of unwinding into the caller.
pub(crate) async fn spawn_catching<F>(fut: F) -> Result<F::Output, String>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(fut).await.map_err(describe_join_error)
}

/// Await `fut` in place. A panic inside it is returned as
/// `Err("panic: <message>")`. For futures that borrow and cannot be spawned.
pub(crate) async fn catch_panic<F: Future>(fut: F) -> Result<F::Output, String> {
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|payload| format!("panic: {}", panic_message(payload)))
}

pub(crate) fn describe_join_error(err: JoinError) -> String {
    if err.is_panic() {
        format!("panic: {}", panic_message(err.into_panic()))
    } else {
        "task cancelled".to_string()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "unknown panic payload".to_string(),
        },
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_output() {
        assert_eq!(spawn_catching(async { 7 }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let err = spawn_catching(async {
            if true {
                panic!("disk on fire");
            }
        })
        .await
        .unwrap_err();
        assert_eq!(err, "panic: disk on fire");

        let owned = spawn_catching(async {
            let code = 3;
            if code > 0 {
                panic!("exit {code}");
            }
        })
        .await
        .unwrap_err();
        assert_eq!(owned, "panic: exit 3");
    }

    #[tokio::test]
    async fn catch_panic_works_on_borrowed_futures() {
        let name = String::from("backup");
        let ok = catch_panic(async { name.len() }).await.unwrap();
        assert_eq!(ok, 6);

        let err = catch_panic(async {
            if !name.is_empty() {
                panic!("formatter broke on {name}");
            }
        })
        .await
        .unwrap_err();
        assert_eq!(err, "panic: formatter broke on backup");
    }
}
