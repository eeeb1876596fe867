//! Quick gateway connection probe: connect, read the greeting, request the
//! version action, and dump the frames.

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[tokio::main]
async fn main() {
    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:8082/ws".to_string());
    println!("Connecting to: {}", url);

    let (mut ws, response) = match tokio::time::timeout(
        std::time::Duration::from_secs(10),
        connect_async(&url),
    )
    .await
    {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            println!("Connection error: {:?}", e);
            return;
        }
        Err(_) => {
            println!("Connection timed out after 10 seconds!");
            return;
        }
    };
    println!("Connected! Status: {:?}", response.status());

    let request = r#"{"action": ["version", "read"], "meta": {"probe": true}}"#;
    ws.send(Message::Text(request.into())).await.expect("send failed");

    while let Some(frame) = ws.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                println!("<- {}", text);
                if text.contains("\"probe\"") {
                    break;
                }
            }
            Ok(other) => println!("<- {:?}", other),
            Err(e) => {
                println!("Read error: {:?}", e);
                break;
            }
        }
    }
}
