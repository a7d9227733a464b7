use sentry_core::protocol::SpanStatus;
use sentry_core::{Hub, SentryFutureExt, TransactionContext};
use std::any::Any;
use std::future::Future;

/// Run `callback` inside a Sentry transaction named `transaction_name`.
pub(crate) async fn with_sentry_transaction<F, Fut, R, E>(
    transaction_name: &str,
    callback: F,
) -> Result<R, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let hub = Hub::new_from_top(Hub::current());
    let tx_ctx = TransactionContext::new(transaction_name, "queue.process");
    let tx = hub.start_transaction(tx_ctx);

    let result = callback().bind_hub(hub).await;

    tx.set_status(match result.is_ok() {
        true => SpanStatus::Ok,
        false => SpanStatus::UnknownError,
    });
    tx.finish();

    result
}

/// Extract a readable message from a caught panic payload.
pub(crate) fn panic_message(info: &(dyn Any + Send + 'static)) -> String {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = info.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::panic::AssertUnwindSafe;

    #[tokio::test]
    async fn panics_are_turned_into_messages() {
        let caught = AssertUnwindSafe(async { panic!("carrier client exploded") })
            .catch_unwind()
            .await
            .map(|()| ())
            .unwrap_err();
        assert_eq!(panic_message(&*caught), "carrier client exploded");

        let number = 42;
        let caught = AssertUnwindSafe(async move { panic!("job {number} exploded") })
            .catch_unwind()
            .await
            .map(|()| ())
            .unwrap_err();
        assert_eq!(panic_message(&*caught), "job 42 exploded");
    }

    #[tokio::test]
    async fn sentry_transaction_passes_the_result_through() {
        let result: Result<u8, ()> = with_sentry_transaction("test", || async { Ok(3) }).await;
        assert_eq!(result, Ok(3));
    }
}
