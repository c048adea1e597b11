use buff_web::{
    limits::{ConnLimits, ServerLimits},
    Context, Request, Router, Server,
};
use std::{thread, time::Duration};

fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let mut router = Router::new();
    router
        .post("/echo", |req: &Request, ctx: &mut Context| {
            let content_type = req.header("Content-Type").unwrap_or("application/octet-stream");
            ctx.response()
                .set_header("Content-Type", content_type)
                .write(req.body());
        })
        .unwrap();
    router
        .get("/echo/*rest", |req: &Request, ctx: &mut Context| {
            let rest = ctx.param("rest").unwrap_or_default().to_owned();
            ctx.response()
                .write(rest)
                .write(" from ")
                .write(req.remote_addr().map(|addr| addr.to_string()).unwrap_or_default());
        })
        .unwrap();

    let server = Server::builder()
        .bind("127.0.0.1:8080")
        .router(router)
        .server_limits(ServerLimits {
            event_loops: 2,
            ..ServerLimits::default()
        })
        .connection_limits(ConnLimits {
            max_body_size: 64 * 1024,
            idle_timeout: Some(Duration::from_secs(30)),
            ..ConnLimits::default()
        })
        .build()
        .unwrap();

    let handle = server.handle();
    thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
            tracing::info!("Shutdown signal received");
            handle.shutdown();
        }
    });

    server.launch().unwrap();
}
