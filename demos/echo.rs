//! Echo round trip - server and client in one process.
//!
//! Binds a transport on a dynamic port, answers every request with its
//! own payload, and drives a handful of concurrent RPCs through one
//! session.
//!
//! ```sh
//! cargo run --example echo
//! ```

use wiremux::{Buffer, ServiceLocator, TcpTransport};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let locator = ServiceLocator::parse("tcp:host=127.0.0.1,port=0")?;
    let transport = std::sync::Arc::new(TcpTransport::bind(&locator).await?);
    println!("listening on {}", transport.service_locator());

    // Echo every request back on the connection it arrived on.
    let server = transport.clone();
    tokio::spawn(async move {
        loop {
            match server.server_recv().await {
                Ok(rpc) => {
                    let payload = rpc.request().to_bytes();
                    rpc.send_reply(Buffer::from_bytes(payload));
                }
                Err(e) => {
                    eprintln!("server_recv failed: {e}");
                    return;
                }
            }
        }
    });

    let advertised = ServiceLocator::parse(transport.service_locator())?;
    let session = transport.get_session(&advertised)?;

    // Several RPCs in flight on one connection; replies find their
    // callers by nonce.
    let handles: Vec<_> = (0..5)
        .map(|i| {
            let request = Buffer::from(format!("message {i}").into_bytes());
            session.call(request)
        })
        .collect::<Result<_, _>>()?;

    for handle in handles {
        let nonce = handle.nonce();
        let reply = handle.response().await?;
        println!("rpc {nonce} echoed {:?}", String::from_utf8_lossy(&reply.to_bytes()));
    }

    Ok(())
}
