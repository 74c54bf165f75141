//! Process-wide cancellation bound to termination signals

use crate::common::{Error, Result};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Create a token that is cancelled on SIGINT or SIGTERM.
///
/// Must be called from within a Tokio runtime.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::warn!("Termination signal received, cancelling");
        trigger.cancel();
    });
    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("Cannot install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Run `fut` unless `cancel` fires first, in which case
/// [`Error::Cancelled`] is returned and `fut` is dropped.
pub async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}

/// Run blocking work on the blocking pool, abandoning the wait on
/// cancellation. The closure gets the token so it can stop before
/// committing anything.
pub async fn run_blocking<F, T>(cancel: &CancellationToken, f: F) -> Result<T>
where
    F: FnOnce(&CancellationToken) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let token = cancel.clone();
    cancellable(cancel, async move {
        tokio::task::spawn_blocking(move || f(&token))
            .await
            .map_err(|e| Error::Operation(format!("blocking task failed: {}", e)))?
    })
    .await
}

/// Bail out early when the token has already fired
pub fn check(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancellable_completes() {
        let token = CancellationToken::new();
        let value = cancellable(&token, async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_future() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let res = tokio::time::timeout(
            Duration::from_secs(5),
            cancellable(&token, async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }),
        )
        .await
        .expect("cancellation must not hang");

        assert!(matches!(res, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_run_blocking_observes_token() {
        let token = CancellationToken::new();
        token.cancel();
        let res = run_blocking(&token, |_| Ok(1)).await;
        assert!(matches!(res, Err(Error::Cancelled)));
    }

    #[test]
    fn test_check() {
        let token = CancellationToken::new();
        assert!(check(&token).is_ok());
        token.cancel();
        assert!(check(&token).unwrap_err().is_cancelled());
    }
}
