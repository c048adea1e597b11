use buff_web::{
    limits::{ConnLimits, ServerLimits},
    Context, Request, Router, Server, ServerHandle, StatusCode,
};
use std::{
    io::{BufRead, BufReader, Read, Write},
    net::{SocketAddr, TcpStream},
    thread::{self, JoinHandle},
    time::Duration,
};

struct Running {
    addr: SocketAddr,
    handle: ServerHandle,
    thread: JoinHandle<std::io::Result<()>>,
}

impl Running {
    fn stop(self) {
        self.handle.shutdown();
        self.thread.join().unwrap().unwrap();
    }
}

fn start() -> Running {
    let mut router = Router::new();
    router
        .get("/hello", |_: &Request, ctx: &mut Context| {
            ctx.response().write("hello");
        })
        .unwrap();
    router
        .post("/echo", |req: &Request, ctx: &mut Context| {
            ctx.response().write(req.body());
        })
        .unwrap();
    router
        .get("/users/:id/files/*path", |_: &Request, ctx: &mut Context| {
            let id = ctx.param("id").unwrap_or_default().to_owned();
            let path = ctx.param("path").unwrap_or_default().to_owned();
            ctx.response().write(id).write("|").write(path);
        })
        .unwrap();
    router
        .get("/peer", |req: &Request, ctx: &mut Context| {
            let known = req.remote_addr().is_some();
            ctx.response().write(known);
        })
        .unwrap();
    router
        .get("/panic", |_: &Request, _: &mut Context| panic!("handler failure"))
        .unwrap();
    router
        .delete("/items/:id", |_: &Request, ctx: &mut Context| {
            ctx.response().write_header(StatusCode::NoContent);
        })
        .unwrap();

    let server = Server::builder()
        .bind("127.0.0.1:0")
        .router(router)
        .server_limits(ServerLimits {
            event_loops: 2,
            shutdown_timeout: Duration::from_secs(1),
            ..ServerLimits::default()
        })
        .connection_limits(ConnLimits {
            max_header_bytes: 1024,
            ..ConnLimits::default()
        })
        .build()
        .unwrap();

    let addr = server.local_addr();
    let handle = server.handle();
    let thread = thread::spawn(move || server.launch());

    Running {
        addr,
        handle,
        thread,
    }
}

fn connect(addr: SocketAddr) -> BufReader<TcpStream> {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    BufReader::new(stream)
}

struct Response {
    status: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn body(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }
}

fn read_response(reader: &mut BufReader<TcpStream>) -> Response {
    let mut status = String::new();
    reader.read_line(&mut status).unwrap();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(": ").unwrap();
        headers.push((name.to_owned(), value.to_owned()));
    }

    let mut response = Response {
        status: status.trim_end().to_owned(),
        headers,
        body: Vec::new(),
    };
    let length: usize = response.header("Content-Length").unwrap().parse().unwrap();
    response.body.resize(length, 0);
    reader.read_exact(&mut response.body).unwrap();

    response
}

fn send(reader: &mut BufReader<TcpStream>, bytes: &[u8]) {
    reader.get_mut().write_all(bytes).unwrap();
}

fn assert_closed(reader: &mut BufReader<TcpStream>) {
    let mut rest = Vec::new();
    assert_eq!(reader.read_to_end(&mut rest).unwrap(), 0);
}

#[test]
fn keep_alive_and_pipelining() {
    let server = start();
    let mut conn = connect(server.addr);

    send(
        &mut conn,
        b"GET /hello HTTP/1.1\r\nHost: t\r\n\r\n\
          POST /echo HTTP/1.1\r\nHost: t\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n\
          GET /users/7/files/a/b.txt HTTP/1.1\r\nHost: t\r\n\r\n",
    );

    let first = read_response(&mut conn);
    assert_eq!(first.status, "HTTP/1.1 200 OK");
    assert_eq!(first.body(), "hello");
    assert_eq!(first.header("Server"), Some("buff_web"));
    assert!(first.header("Date").is_some());
    assert_eq!(first.header("Connection"), None);

    assert_eq!(read_response(&mut conn).body(), "Wikipedia");
    assert_eq!(read_response(&mut conn).body(), "7|a/b.txt");

    // Same connection, split across writes.
    send(&mut conn, b"GET /pe");
    thread::sleep(Duration::from_millis(20));
    send(&mut conn, b"er HTTP/1.1\r\nHost: t\r\n\r\n");
    assert_eq!(read_response(&mut conn).body(), "true");

    server.stop();
}

#[test]
fn routing_errors_keep_connection() {
    let server = start();
    let mut conn = connect(server.addr);

    #[rustfmt::skip]
    let cases = [
        ("GET /missing HTTP/1.1\r\nHost: t\r\n\r\n",  "HTTP/1.1 404 Not Found",             "{\"error\":\"route not found\"}\n"),
        ("POST /hello HTTP/1.1\r\nHost: t\r\n\r\n",   "HTTP/1.1 405 Method Not Allowed",    "{\"error\":\"method not allowed\"}\n"),
        ("GET /panic HTTP/1.1\r\nHost: t\r\n\r\n",    "HTTP/1.1 500 Internal Server Error", "{\"error\":\"internal error\"}\n"),
        ("DELETE /items/9 HTTP/1.1\r\nHost: t\r\n\r\n", "HTTP/1.1 204 No Content",          ""),
        ("GET //hello/ HTTP/1.1\r\nHost: t\r\n\r\n",  "HTTP/1.1 200 OK",                    "hello"),
    ];

    for (request, status, body) in cases {
        send(&mut conn, request.as_bytes());
        let response = read_response(&mut conn);

        assert_eq!(response.status, status, "{request:?}");
        assert_eq!(response.body(), body, "{request:?}");
    }

    server.stop();
}

#[test]
fn connection_close() {
    let server = start();

    #[rustfmt::skip]
    let cases = [
        "GET /hello HTTP/1.0\r\n\r\n",
        "GET /hello HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
        "GET /hello HTTP/1.0\r\nConnection: keep-alive, close\r\n\r\n",
    ];

    for request in cases {
        let mut conn = connect(server.addr);
        send(&mut conn, request.as_bytes());

        let response = read_response(&mut conn);
        assert_eq!(response.status, "HTTP/1.1 200 OK", "{request:?}");
        assert_eq!(response.header("Connection"), Some("close"), "{request:?}");
        assert_closed(&mut conn);
    }

    let mut conn = connect(server.addr);
    send(&mut conn, b"GET /hello HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
    let response = read_response(&mut conn);
    assert_eq!(response.header("Connection"), Some("keep-alive"));
    send(&mut conn, b"GET /hello HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
    assert_eq!(read_response(&mut conn).body(), "hello");

    server.stop();
}

#[test]
fn protocol_errors_close() {
    let server = start();

    let long_header = format!("GET /hello HTTP/1.1\r\nX-Big: {}\r\n\r\n", "a".repeat(2048));

    #[rustfmt::skip]
    let cases = [
        ("GET /hello HTTP/2.0\r\n\r\n".to_owned(),                           "HTTP/1.1 400 Bad Request"),
        ("GET /hello\r\n\r\n".to_owned(),                                    "HTTP/1.1 400 Bad Request"),
        ("POST /echo HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n".to_owned(), "HTTP/1.1 400 Bad Request"),
        ("GET http://example.com/hello HTTP/1.1\r\n\r\n".to_owned(),         "HTTP/1.1 400 Bad Request"),
        (long_header,                                                        "HTTP/1.1 431 Request Header Fields Too Large"),
    ];

    for (request, status) in cases {
        let mut conn = connect(server.addr);
        send(&mut conn, request.as_bytes());

        let response = read_response(&mut conn);
        assert_eq!(response.status, status, "{request:?}");
        assert_eq!(response.header("Connection"), Some("close"));
        assert_eq!(response.header("Content-Type"), Some("application/json"));
        assert_closed(&mut conn);
    }

    server.stop();
}

#[test]
fn graceful_shutdown() {
    let server = start();
    let mut idle = connect(server.addr);

    send(&mut idle, b"GET /hello HTTP/1.1\r\nHost: t\r\n\r\n");
    assert_eq!(read_response(&mut idle).body(), "hello");

    let addr = server.addr;
    server.stop();

    assert_closed(&mut idle);
    assert!(TcpStream::connect(addr).is_err());
}
