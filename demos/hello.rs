use buff_web::{timeout, Context, Request, Router, Server, ServerHandle, StatusCode};
use std::{thread, time::Duration};

fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let mut router = Router::new();
    router.use_middleware(timeout(Duration::from_secs(1)));

    router
        .get("/", |_: &Request, ctx: &mut Context| {
            ctx.response()
                .set_header("Content-Type", "text/plain")
                .write("Hello, world!");
        })
        .unwrap();

    let mut users = router.group("/users");
    users
        .get("/:id", |_: &Request, ctx: &mut Context| {
            let id = ctx.param("id").unwrap_or_default().to_owned();
            ctx.response()
                .json(StatusCode::Ok, &format!(r#"{{"id":{id:?}}}"#));
        })
        .unwrap();
    users
        .post("/", |req: &Request, ctx: &mut Context| {
            let name = String::from_utf8_lossy(req.body()).into_owned();
            ctx.response()
                .json(StatusCode::Created, &format!(r#"{{"name":{name:?}}}"#));
        })
        .unwrap();

    router
        .get("/static/*filepath", |_: &Request, ctx: &mut Context| {
            let path = ctx.param("filepath").unwrap_or_default().to_owned();
            ctx.response().write("serving ").write(path);
        })
        .unwrap();

    print!("{}", router.dump());

    let server = Server::builder()
        .bind("127.0.0.1:8080")
        .router(router)
        .build()
        .unwrap();

    stop_on_ctrl_c(server.handle());
    server.launch().unwrap();
}

fn stop_on_ctrl_c(handle: ServerHandle) {
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
}
