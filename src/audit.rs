/// Audit macro for identity token events.
///
/// Wraps `tracing::info!`, adding `audit=true`, `auditType="identity-token"`
/// and the current request's endpoint, host and method.
///
/// ```ignore
/// crate::audit!(audience = %audience, "minted identity token");
/// ```
#[macro_export]
macro_rules! audit {
    ($($arg:tt)+) => {
        $crate::middleware::with_request_info(|ctx| {
            tracing::info!(
                audit = true,
                auditType = "identity-token",
                endpoint = %ctx.endpoint,
                host = %ctx.host,
                httpMethod = %ctx.method,
                $($arg)+
            )
        })
    };
}
