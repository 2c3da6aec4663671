use clap::Parser;
use rustdis_client::config::DEFAULT_ADDRESS;
use rustdis_client::{cmd, Charset, Client, CommandError, Config, Error, Frame, ListenerHandle, Message};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(version, about = "Send a command to a Redis server and print the reply")]
struct Args {
    /// Server address, host:port
    #[arg(short, long, env = "RUSTDIS_ADDRESS", default_value = DEFAULT_ADDRESS)]
    address: String,

    /// Character set for arguments and channel names
    #[arg(long, env = "RUSTDIS_CHARSET", default_value = "utf-8")]
    charset: Charset,

    /// Treat the arguments as channels, subscribe and print messages until interrupted
    #[arg(short, long)]
    subscribe: bool,

    /// The command and its arguments, or the channels to subscribe to
    #[arg(required = true)]
    words: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let args = Args::parse();
    let config = Config::from_env()?
        .address(args.address)
        .charset(args.charset);
    let client = Client::connect(&config).await?;

    if args.subscribe {
        return subscribe(&client, &args.words).await;
    }

    let (name, rest) = args.words.split_first().ok_or("missing command")?;
    match client.submit(cmd(name).args(rest)).await {
        Ok(frame) => println!("{}", render(&frame, 0)),
        Err(CommandError::Server(err)) => println!("(error) {}", err),
        Err(err) => return Err(err.into()),
    }

    Ok(())
}

async fn subscribe(client: &Client, channels: &[String]) -> Result<(), Error> {
    let listener = ListenerHandle::new(|message: &Message| {
        println!("{}: {}", message.channel, message.payload.escape_ascii());
    });

    let active = client.subscribe(&listener, channels).await?;
    println!("Subscribed ({} active). Press Ctrl-C to stop.", active);

    tokio::signal::ctrl_c().await?;

    client.unsubscribe(&listener, &[] as &[&str]).await?;
    Ok(())
}

/// Formats a reply the way redis-cli does.
fn render(frame: &Frame, indent: usize) -> String {
    match frame {
        Frame::Simple(s) => s.clone(),
        Frame::Error(s) => format!("(error) {}", s),
        Frame::Integer(i) => format!("(integer) {}", i),
        Frame::Bulk(bytes) => format!("\"{}\"", bytes.escape_ascii()),
        Frame::Null | Frame::NullArray => "(nil)".to_string(),
        Frame::Array(items) if items.is_empty() => "(empty array)".to_string(),
        Frame::Array(items) => {
            let width = items.len().to_string().len();
            items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    let prefix = format!("{:>width$}) ", i + 1, width = width);
                    let padding = if i == 0 { 0 } else { indent };
                    format!(
                        "{}{}{}",
                        " ".repeat(padding),
                        prefix,
                        render(item, indent + prefix.len())
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn render_scalars() {
        assert_eq!(render(&Frame::Simple("OK".to_string()), 0), "OK");
        assert_eq!(render(&Frame::Integer(3), 0), "(integer) 3");
        assert_eq!(render(&Frame::Bulk(Bytes::from("a\nb")), 0), "\"a\\nb\"");
        assert_eq!(render(&Frame::Null, 0), "(nil)");
    }

    #[test]
    fn render_nested_array() {
        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from("0")),
            Frame::Array(vec![Frame::Bulk(Bytes::from("k1")), Frame::Bulk(Bytes::from("k2"))]),
        ]);

        assert_eq!(render(&frame, 0), "1) \"0\"\n2) 1) \"k1\"\n   2) \"k2\"");
    }
}
