use crate::executor::CommandOutput;
use sentry_core::protocol::SpanStatus;
use sentry_core::{Hub, SentryFutureExt, TransactionContext};
use std::any::Any;
use std::future::Future;
use std::sync::Arc;

/// Turns the payload of a caught panic into a failure description.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> String {
    if let Some(message) = info.downcast_ref::<&str>() {
        format!("command runner panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        format!("command runner panicked: {message}")
    } else {
        "command runner panicked".to_string()
    }
}

/// Runs `callback` inside a Sentry transaction named `transaction_name`.
///
/// Without a Sentry client bound to the current hub this only costs a few
/// allocations.
pub(crate) async fn with_sentry_transaction<F, Fut>(
    transaction_name: &str,
    callback: F,
) -> CommandOutput
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = CommandOutput>,
{
    let hub = Arc::new(Hub::new_from_top(Hub::current()));

    let tx_ctx = TransactionContext::new(transaction_name, "qq.execute");
    let tx = sentry_core::start_transaction(tx_ctx);
    hub.configure_scope(|scope| scope.set_span(Some(tx.clone().into())));

    let output = callback().bind_hub(hub).await;

    tx.set_status(if output.success() {
        SpanStatus::Ok
    } else {
        SpanStatus::UnknownError
    });
    tx.finish();

    output
}
