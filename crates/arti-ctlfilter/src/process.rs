//! Code to handle process-level signals.

/// Return an async stream that reports an event whenever we get a `SIGHUP`
/// signal.
///
/// Note that the signal-handling backend can coalesce signals; this is normal.
///
/// Must be called from within a tokio runtime.
pub(crate) fn sighup_stream() -> std::io::Result<impl futures::Stream<Item = ()>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix as s;
        let mut signal = s::signal(s::SignalKind::hangup())?;
        Ok(futures::stream::poll_fn(move |ctx| signal.poll_recv(ctx)))
    }
    #[cfg(not(unix))]
    {
        // We won't ever get a SIGHUP.
        Ok(futures::stream::pending())
    }
}

/// Wait until the user asks us to exit with ctrl-c (or `SIGINT`).
pub(crate) async fn wait_for_ctrl_c() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
