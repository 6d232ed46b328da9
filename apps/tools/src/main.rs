use std::{collections::HashSet, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    config::{load_settings, prepare_database_url, KeyStrategy, Settings},
    read_state::mark_conversation_read,
    ChatClient, ConversationEvent, TranscriptEntry,
};
use e2ee::IdentityKeyPair;
use shared::domain::{MessageId, UserId};
use storage::{ConversationStore, KeyDirectory, Storage};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dm", about = "Encrypted direct messages over a local store")]
struct Cli {
    /// Overrides `database_url` from dm.toml and the environment.
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    key_strategy: Option<KeyStrategy>,
    #[arg(long)]
    passphrase: Option<String>,
    /// Base64 X25519 secret printed by `keygen`.
    #[arg(long)]
    identity_secret: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Prints a fresh user id and identity key pair.
    Keygen,
    PublishKey {
        user: String,
    },
    Send {
        from: String,
        to: String,
        text: String,
        #[arg(long)]
        attachment_url: Option<String>,
    },
    /// Prints the transcript. Opening it marks inbound messages read.
    History {
        me: String,
        peer: String,
    },
    Watch {
        me: String,
        peer: String,
    },
    MarkRead {
        me: String,
        peer: String,
    },
    Unread {
        me: String,
        peer: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = apply_cli(load_settings(), &cli);

    if let Command::Keygen = cli.command {
        let identity = IdentityKeyPair::generate();
        println!("user_id={}", UserId::random());
        println!("public_key={}", identity.public_key_b64());
        println!("identity_secret={}", identity.secret_b64().as_str());
        return Ok(());
    }

    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Arc::new(Storage::with_feed_capacity(&database_url, settings.feed_capacity).await?);
    let result = run(cli.command, &settings, &storage).await;
    storage.close().await;
    result
}

fn apply_cli(mut settings: Settings, cli: &Cli) -> Settings {
    if let Some(v) = &cli.database_url {
        settings.database_url = v.clone();
    }
    if let Some(v) = cli.key_strategy {
        settings.key_strategy = v;
    }
    if let Some(v) = &cli.passphrase {
        settings.passphrase = Some(v.clone());
    }
    if let Some(v) = &cli.identity_secret {
        settings.identity_secret = Some(v.clone());
    }
    settings
}

async fn run(command: Command, settings: &Settings, storage: &Arc<Storage>) -> Result<()> {
    match command {
        Command::Keygen => {}
        Command::PublishKey { user } => {
            let client = client_for(settings, storage, parse_user(&user)?)?;
            client.publish_identity().await?;
            let published = storage
                .public_key(client.local_user())
                .await?
                .context("public key missing after publish")?;
            println!("published public_key={published}");
        }
        Command::Send {
            from,
            to,
            text,
            attachment_url,
        } => {
            let client = client_for(settings, storage, parse_user(&from)?)?;
            let conversation = client.open_conversation(parse_user(&to)?).await?;
            let sent = match attachment_url {
                Some(url) => conversation.send_attachment(&text, &url).await?,
                None => conversation.send(&text).await?,
            };
            match sent {
                Some(entry) => println!("sent message_id={}", entry.id()),
                None => warn!("dm: nothing to send"),
            }
        }
        Command::History { me, peer } => {
            let client = client_for(settings, storage, parse_user(&me)?)?;
            let conversation = client.open_conversation(parse_user(&peer)?).await?;
            for entry in conversation.entries().await {
                print_entry(&entry, client.local_user());
            }
        }
        Command::Watch { me, peer } => {
            let client = client_for(settings, storage, parse_user(&me)?)?;
            let conversation = client.open_conversation(parse_user(&peer)?).await?;
            watch(&conversation, client.local_user()).await?;
        }
        Command::MarkRead { me, peer } => {
            let updated =
                mark_conversation_read(storage.as_ref(), parse_user(&me)?, parse_user(&peer)?).await;
            println!("marked_read={updated}");
        }
        Command::Unread { me, peer } => {
            let unread = storage
                .unread_count(parse_user(&me)?, parse_user(&peer)?)
                .await?;
            println!("unread={unread}");
        }
    }
    Ok(())
}

async fn watch(conversation: &client_core::Conversation, local: UserId) -> Result<()> {
    let mut events = conversation.subscribe();
    let mut printed: HashSet<MessageId> = HashSet::new();
    for entry in conversation.entries().await {
        printed.insert(entry.id());
        print_entry(&entry, local);
    }
    info!(peer = %conversation.peer(), "dm: watching; ctrl-c to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ConversationEvent::Appended(entry)) => {
                    if printed.insert(entry.id()) {
                        print_entry(&entry, local);
                    }
                }
                Ok(ConversationEvent::Backfilled(entries)) => {
                    for entry in entries.iter().filter(|entry| printed.insert(entry.id())) {
                        print_entry(entry, local);
                    }
                }
                Ok(ConversationEvent::Error(err)) => warn!(error = %err, "dm: conversation error"),
                Ok(ConversationEvent::Closed) | Err(RecvError::Closed) => break,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "dm: display fell behind"),
            },
        }
    }
    Ok(())
}

fn client_for(settings: &Settings, storage: &Arc<Storage>, user: UserId) -> Result<ChatClient> {
    let keys = settings.key_source()?;
    Ok(ChatClient::new(Arc::clone(storage), user, keys)
        .with_options(settings.conversation_options()))
}

fn parse_user(raw: &str) -> Result<UserId> {
    UserId::parse(raw).with_context(|| format!("invalid user id '{raw}'"))
}

fn print_entry(entry: &TranscriptEntry, local: UserId) {
    let direction = if entry.is_from(local) { ">" } else { "<" };
    let read = if entry.record.is_read { "" } else { " *" };
    let attachment = entry
        .record
        .attachment_url
        .as_deref()
        .map(|url| format!(" [{url}]"))
        .unwrap_or_default();
    println!(
        "{} {direction} {}{attachment}{read}",
        entry.record.created_at.format("%Y-%m-%d %H:%M:%S"),
        entry.text
    );
}
