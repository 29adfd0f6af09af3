//! End-to-end smoke run: seed an in-memory conversation, open it through the
//! runtime, page back to the first message, then send, edit and delete one
//! message and print the final timeline summary as JSON.

mod config;
mod logging;

use std::{process, sync::Arc, time::Duration};

use chat_core::{
    ConversationCommand, ConversationEvent, ConversationInfo, ConversationLifecycleState,
    EventStream, SendAck, Session, TimelineUpdate, UpdateCause,
};
use chat_platform::InMemoryChatBackend;
use chat_runtime::{ConversationHandle, spawn_conversation};
use config::SmokeConfig;
use tokio::time::timeout;
use tracing::{debug, error, info};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "invalid smoke configuration");
            process::exit(2);
        }
    };

    if let Err(err) = run(config).await {
        error!(%err, "smoke run failed");
        process::exit(1);
    }
}

async fn run(config: SmokeConfig) -> Result<(), String> {
    info!(
        conversation_id = %config.conversation_id,
        history = config.history,
        page_size = config.runtime.page_size,
        "starting chat smoke"
    );

    let backend = Arc::new(InMemoryChatBackend::new());
    backend
        .add_conversation(ConversationInfo {
            id: config.conversation_id.clone(),
            title: "Smoke conversation".to_owned(),
            members: vec![config.user_id.clone(), "smoke-peer".to_owned()],
            task_status: None,
        })
        .map_err(|err| err.to_string())?;
    backend
        .seed_sequential(&config.conversation_id, "smoke-peer", config.history)
        .map_err(|err| err.to_string())?;

    let handle = spawn_conversation(
        Arc::clone(&backend),
        Session::new(config.user_id.clone()),
        config.conversation_id.clone(),
        config.runtime,
    );
    let mut events = handle.subscribe();

    send(&handle, ConversationCommand::Open).await?;
    let mut latest = next_timeline(&mut events, |update| update.cause == UpdateCause::InitialPage)
        .await?;
    info!(loaded = latest.sequence.len(), "initial page loaded");

    let mut pages = 0;
    while !latest.all_older_loaded {
        send(
            &handle,
            ConversationCommand::UpdateViewport {
                first_visible: 0,
                last_visible: latest.sequence.len().min(10).saturating_sub(1),
            },
        )
        .await?;
        latest = next_timeline(&mut events, |update| update.cause == UpdateCause::OlderPage)
            .await?;
        pages += 1;
        debug!(
            loaded = latest.sequence.len(),
            anchor = ?latest.scroll_anchor_index,
            "older page loaded"
        );
    }
    info!(pages, loaded = latest.sequence.len(), "history exhausted");

    let sent = write(
        &handle,
        &mut events,
        ConversationCommand::Send {
            client_txn_id: "smoke-send".to_owned(),
            content: "smoke check".to_owned(),
        },
    )
    .await?;
    let message_id = sent
        .message_id
        .ok_or_else(|| "send acknowledged without message id".to_owned())?;
    write(
        &handle,
        &mut events,
        ConversationCommand::Edit {
            client_txn_id: "smoke-edit".to_owned(),
            message_id: message_id.clone(),
            new_content: "smoke check (edited)".to_owned(),
        },
    )
    .await?;
    write(
        &handle,
        &mut events,
        ConversationCommand::Delete {
            client_txn_id: "smoke-delete".to_owned(),
            message_id: message_id.clone(),
        },
    )
    .await?;
    let latest = next_timeline(&mut events, |update| {
        update
            .sequence
            .iter()
            .any(|message| message.id == message_id && message.is_deleted)
    })
    .await?;

    send(&handle, ConversationCommand::Close).await?;
    next_event(&mut events, |event| {
        *event
            == ConversationEvent::StateChanged {
                state: ConversationLifecycleState::Disposed,
            }
    })
    .await?;

    let summary = serde_json::json!({
        "conversation": config.conversation_id.to_string(),
        "messages": latest.sequence.len(),
        "tombstones": latest.sequence.iter().filter(|m| m.is_deleted).count(),
        "older_pages": pages,
        "first_timestamp_ms": latest.sequence.first().map(|m| m.timestamp_ms),
        "last_timestamp_ms": latest.sequence.last().map(|m| m.timestamp_ms),
    });
    println!("{summary}");
    Ok(())
}

async fn send(handle: &ConversationHandle, command: ConversationCommand) -> Result<(), String> {
    handle.send(command).await.map_err(|err| err.to_string())
}

async fn write(
    handle: &ConversationHandle,
    events: &mut EventStream,
    command: ConversationCommand,
) -> Result<SendAck, String> {
    let kind = command.kind();
    send(handle, command).await?;
    let event = next_event(events, |event| matches!(event, ConversationEvent::SendAck(_))).await?;
    match event {
        ConversationEvent::SendAck(ack) => match &ack.error_code {
            None => {
                debug!(kind, client_txn_id = %ack.client_txn_id, "write acknowledged");
                Ok(ack)
            }
            Some(code) => Err(format!("{kind} rejected: {code}")),
        },
        other => Err(format!("unexpected event: {other:?}")),
    }
}

async fn next_timeline<F>(events: &mut EventStream, mut predicate: F) -> Result<TimelineUpdate, String>
where
    F: FnMut(&TimelineUpdate) -> bool,
{
    let event = next_event(events, |event| {
        matches!(event, ConversationEvent::TimelineUpdated(update) if predicate(update))
    })
    .await?;
    match event {
        ConversationEvent::TimelineUpdated(update) => Ok(update),
        other => Err(format!("unexpected event: {other:?}")),
    }
}

/// Wait for the first event matching `predicate`. Runtime errors fail the run.
async fn next_event<F>(events: &mut EventStream, mut predicate: F) -> Result<ConversationEvent, String>
where
    F: FnMut(&ConversationEvent) -> bool,
{
    timeout(EVENT_TIMEOUT, async {
        loop {
            let event = events.recv().await.map_err(|err| err.to_string())?;
            if let ConversationEvent::Error { code, message, .. } = &event {
                return Err(format!("{code}: {message}"));
            }
            if predicate(&event) {
                return Ok(event);
            }
        }
    })
    .await
    .map_err(|_| "timed out waiting for runtime event".to_owned())?
}
