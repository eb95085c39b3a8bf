use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A blocking HTTP/1.1 server answering one connection with canned responses.
pub struct MockHttpServer {
    listener: TcpListener,
    port: u16,
}

impl MockHttpServer {
    /// Bind to a random local port.
    pub fn new() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept one connection and answer each request head with the next
    /// response. Returns the request heads received.
    pub fn serve(self, responses: Vec<Vec<u8>>) -> JoinHandle<Vec<String>> {
        thread::spawn(move || {
            let (mut stream, _) = self.listener.accept().expect("accept");
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .expect("read timeout");

            let mut heads = Vec::new();
            let mut buf = Vec::new();
            for response in responses {
                let head = loop {
                    if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        let head: Vec<u8> = buf.drain(..end + 4).collect();
                        break String::from_utf8_lossy(&head).into_owned();
                    }
                    let mut chunk = [0u8; 4096];
                    match stream.read(&mut chunk) {
                        Ok(0) | Err(_) => return heads,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                };
                tracing::debug!("mock server got request: {:?}", head.lines().next());
                heads.push(head);
                if stream.write_all(&response).is_err() {
                    break;
                }
            }
            heads
        })
    }
}
