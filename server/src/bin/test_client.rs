use clap::Parser;
use rand::Rng;
use server::utils::get_timestamp;
use shared::{
    decode_server_frame, encode_frame, Action, ClientPayload, InterServerPayload, ServerFrame,
    ServerPayload, WireFrame, MAX_FRAME_SIZE, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Duration};

/// Scripted bot: logs in, creates and starts a character, wanders about,
/// chats and logs out.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(short, long, default_value = "127.0.0.1:8080")]
    server: SocketAddr,
    /// Secret shared with the server for inter-server messages
    #[clap(long, default_value = "change-me")]
    peer_secret: String,
    #[clap(short, long, default_value = "1")]
    account: u64,
    /// Number of moves to make
    #[clap(short, long, default_value = "10")]
    moves: u32,
    /// Exit the client after logging out instead of returning to selection
    #[clap(long)]
    exit: bool,
}

async fn send(
    socket: &UdpSocket,
    server: SocketAddr,
    frame: &WireFrame,
) -> Result<(), Box<dyn std::error::Error>> {
    socket.send_to(&encode_frame(frame)?, server).await?;
    Ok(())
}

/// Waits for the next frame matching `wanted`, printing everything else.
async fn expect(
    socket: &UdpSocket,
    wanted: impl Fn(&ServerPayload) -> bool,
) -> Result<ServerFrame, Box<dyn std::error::Error>> {
    let mut buf = [0u8; MAX_FRAME_SIZE];
    loop {
        let (len, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf)).await??;
        let frame = decode_server_frame(&buf[..len])?;
        if wanted(&frame.payload) {
            return Ok(frame);
        }
        if let ServerPayload::Disconnected { reason } = &frame.payload {
            return Err(format!("disconnected by server: {}", reason).into());
        }
        println!("  turn {}: {:?}", frame.turn, frame.payload);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut rng = rand::thread_rng();

    // Play the login service: hand the server a one-time token for the account.
    let token: String = (0..16)
        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
        .collect();
    let peer = UdpSocket::bind("0.0.0.0:0").await?;
    send(
        &peer,
        args.server,
        &WireFrame::Peer {
            secret: args.peer_secret.clone(),
            payload: InterServerPayload::CredentialToken {
                account_id: args.account,
                token: token.clone(),
            },
        },
    )
    .await?;
    sleep(Duration::from_millis(200)).await;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Client socket bound to {}", socket.local_addr()?);

    let started = get_timestamp();
    send(
        &socket,
        args.server,
        &WireFrame::Client(ClientPayload::Handshake {
            account_id: args.account,
            secret: token,
            client_version: PROTOCOL_VERSION,
        }),
    )
    .await?;
    let frame = expect(&socket, |p| matches!(p, ServerPayload::CharacterList { .. })).await?;
    println!(
        "Logged in after {} ms: {:?}",
        get_timestamp().saturating_sub(started),
        frame.payload
    );

    let name = format!("Bot{}", rng.gen_range(1000..10000));
    send(
        &socket,
        args.server,
        &WireFrame::Client(ClientPayload::CreateCharacter { name }),
    )
    .await?;
    let frame = expect(&socket, |p| {
        matches!(
            p,
            ServerPayload::CharacterCreated { .. } | ServerPayload::CreateFailed { .. }
        )
    })
    .await?;
    let character = match frame.payload {
        ServerPayload::CharacterCreated { character } => character,
        other => return Err(format!("could not create a character: {:?}", other).into()),
    };
    println!("Created {} (id {})", character.name, character.id);

    send(
        &socket,
        args.server,
        &WireFrame::Client(ClientPayload::StartCharacter {
            character_id: character.id,
        }),
    )
    .await?;
    let frame = expect(&socket, |p| {
        matches!(
            p,
            ServerPayload::EnterWorld { .. } | ServerPayload::StartFailed { .. }
        )
    })
    .await?;
    println!("Turn {}: {:?}", frame.turn, frame.payload);

    for _ in 0..args.moves {
        let action = Action::Move {
            dx: rng.gen_range(-1..=1),
            dy: rng.gen_range(-1..=1),
        };
        send(
            &socket,
            args.server,
            &WireFrame::Client(ClientPayload::PlayerAction {
                character_id: character.id,
                action,
            }),
        )
        .await?;
        sleep(Duration::from_millis(250)).await;
    }

    send(
        &socket,
        args.server,
        &WireFrame::Client(ClientPayload::Chat {
            character_id: character.id,
            text: format!("hello from {}", character.name),
        }),
    )
    .await?;

    send(
        &socket,
        args.server,
        &WireFrame::Client(ClientPayload::Logout {
            character_id: Some(character.id),
            exit_client: args.exit,
        }),
    )
    .await?;
    let frame = expect(&socket, |p| matches!(p, ServerPayload::LogoutConfirmed { .. })).await?;
    println!("Logged out on turn {}", frame.turn);

    println!("Test client finished");
    Ok(())
}
