//! Echo over TCP - several streams sharing one connection.
//!
//! This example demonstrates:
//! - Running a multiplexer on each end of a TCP connection
//! - Serving accepted streams with plain `tokio::io` utilities via `StreamIo`
//! - Opening concurrent streams from the other side
//!
//! ```text
//! cargo run --example echo
//! ```

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wiremux::{Multiplexer, StreamIo};

/// Echo every accepted stream back to its opener.
async fn serve(listener: TcpListener) -> wiremux::Result<()> {
    let (socket, _) = listener.accept().await?;
    let server = Multiplexer::new(socket, true, None);
    loop {
        let stream = server.accept_stream().await?;
        tokio::spawn(async move {
            let mut io = StreamIo::new(stream);
            let (mut reader, mut writer) = tokio::io::split(&mut io);
            tokio::io::copy(&mut reader, &mut writer).await?;
            writer.shutdown().await
        });
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    tokio::spawn(serve(listener));

    let client = Multiplexer::new(TcpStream::connect(address).await?, false, None);

    let mut tasks = Vec::new();
    for i in 0..3 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let stream = client.open_stream().await?;
            let id = stream.id();
            let mut io = StreamIo::new(stream);
            io.write_all(format!("hello from stream {i}").as_bytes())
                .await?;
            io.shutdown().await?;

            let mut reply = String::new();
            io.read_to_string(&mut reply).await?;
            println!("stream {id}: {reply}");
            Ok::<_, wiremux::Error>(())
        }));
    }
    for task in tasks {
        task.await??;
    }

    client.close();
    Ok(())
}
