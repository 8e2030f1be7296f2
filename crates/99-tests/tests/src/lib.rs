//! End-to-end scenarios for the tracing stack.

#[cfg(test)]
mod end_to_end;

#[cfg(test)]
mod panic_flush;

#[cfg(test)]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
