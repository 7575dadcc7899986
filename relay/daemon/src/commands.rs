//! One-Shot Commands
//!
//! Operator tools that start the relay over its persisted state, do one
//! thing, and flush on the way out.

use anyhow::{Context, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use relay_core::{
    ChatMessage, ChatRequest, ChatResponse, ConversationHandle, Credential, CredentialId,
    RefreshStatus, RequestOrchestrator, StreamFrame,
};

use crate::{ChatArgs, CredentialAction};

async fn start(relay: &RequestOrchestrator) -> Result<()> {
    relay.start().await.context("failed to start relay")
}

// ============================================================================
// Chat
// ============================================================================

/// Send one turn and print the answer; the handle goes to stderr
pub async fn chat(relay: &RequestOrchestrator, args: ChatArgs) -> Result<()> {
    start(relay).await?;
    let result = send(relay, args).await;
    relay.shutdown().await;
    result
}

fn build_request(args: &ChatArgs) -> ChatRequest {
    let mut messages = Vec::new();
    if let Some(system) = &args.system {
        messages.push(ChatMessage::system(system.as_str()));
    }
    messages.push(ChatMessage::user(args.message.as_str()));

    let mut request = ChatRequest::new(args.model.as_str(), messages).with_stream(args.stream);
    if let Some(handle) = &args.conversation {
        request = request.with_conversation(ConversationHandle::from(handle.as_str()));
    }
    request
}

async fn send(relay: &RequestOrchestrator, args: ChatArgs) -> Result<()> {
    let request = build_request(&args);
    let response = relay.chat_completion(request).await?;
    let handle = response.handle().clone();
    debug!(trace_id = %response.trace_id(), handle = %handle, "Chat response");

    let mut out = tokio::io::stdout();
    match response {
        ChatResponse::Complete { completion, .. } => {
            out.write_all(completion.content().as_bytes()).await?;
            out.write_all(b"\n").await?;
            out.flush().await?;
        }
        ChatResponse::Stream {
            mut frames,
            mut encoder,
        } => {
            while let Some(frame) = frames.recv().await {
                if args.sse {
                    if let Some(event) = encoder.encode(&frame) {
                        out.write_all(event.as_bytes()).await?;
                    }
                } else {
                    write_frame(&mut out, &frame).await?;
                }
                out.flush().await?;
                if let StreamFrame::Error(error) = frame {
                    return Err(anyhow::Error::new(error).context("turn failed mid-stream"));
                }
            }
        }
    }
    eprintln!("conversation: {handle}");
    Ok(())
}

async fn write_frame<W: AsyncWrite + Unpin>(out: &mut W, frame: &StreamFrame) -> Result<()> {
    match frame {
        StreamFrame::TextDelta(text)
        | StreamFrame::ThinkingDelta(text)
        | StreamFrame::SearchEvent(text) => out.write_all(text.as_bytes()).await?,
        StreamFrame::Done => out.write_all(b"\n").await?,
        StreamFrame::Error(_) => {}
    }
    Ok(())
}

// ============================================================================
// Models
// ============================================================================

/// Print the model registry as JSON
pub fn models(relay: &RequestOrchestrator) -> Result<()> {
    let list = relay.list_models();
    let json = serde_json::to_string_pretty(&list).context("failed to encode model list")?;
    println!("{json}");
    Ok(())
}

// ============================================================================
// Credentials
// ============================================================================

/// Apply one credential action
pub async fn credentials(relay: &RequestOrchestrator, action: CredentialAction) -> Result<()> {
    start(relay).await?;
    let result = apply(relay, action).await;
    relay.shutdown().await;
    result
}

async fn apply(relay: &RequestOrchestrator, action: CredentialAction) -> Result<()> {
    match action {
        CredentialAction::List => {
            let mut credentials = relay.pool().snapshot();
            credentials.sort_by_key(|c| c.seq);
            print_credentials(&credentials);
            let stats = relay.pool().stats();
            println!(
                "\n{} total, {} active, {} cooling, {} disabled",
                stats.total, stats.active, stats.cooling, stats.disabled
            );
        }
        CredentialAction::Add { secret, name, tier } => {
            let id = relay
                .add_credential(&secret, &name, tier)
                .context("failed to add credential")?;
            println!("added {id}");
        }
        CredentialAction::Remove { id } => {
            let id = CredentialId::from(id.as_str());
            if !relay.remove_credential(&id) {
                anyhow::bail!("credential {id} not found");
            }
            println!("removed {id}");
        }
        CredentialAction::Enable { id } => {
            let id = CredentialId::from(id.as_str());
            relay
                .set_credential_enabled(&id, true)
                .with_context(|| format!("failed to enable {id}"))?;
            println!("enabled {id}");
        }
        CredentialAction::Disable { id } => {
            let id = CredentialId::from(id.as_str());
            relay
                .set_credential_enabled(&id, false)
                .with_context(|| format!("failed to disable {id}"))?;
            println!("disabled {id}");
        }
        CredentialAction::Check { id } => {
            let id = CredentialId::from(id.as_str());
            let status = relay
                .check_credential(&id)
                .await
                .with_context(|| format!("failed to check {id}"))?;
            if status.remaining_quota < 0 {
                warn!(credential = %id, "Upstream did not report a quota");
            }
            println!(
                "{id}: tier {}, remaining quota {}",
                status.tier, status.remaining_quota
            );
        }
        CredentialAction::Refresh => {
            let report = relay
                .refresh_all_credentials()
                .await
                .context("failed to refresh credentials")?;
            for result in &report.results {
                match result.status {
                    RefreshStatus::Refreshed => println!(
                        "{} ({}): remaining quota {}",
                        result.id,
                        result.name,
                        result.remaining_quota.unwrap_or(-1)
                    ),
                    RefreshStatus::Failed => println!(
                        "{} ({}): failed: {}",
                        result.id,
                        result.name,
                        result.error.as_deref().unwrap_or("unknown error")
                    ),
                    RefreshStatus::Skipped => println!("{} ({}): disabled, skipped", result.id, result.name),
                }
            }
            println!(
                "\n{} refreshed, {} failed, {} skipped",
                report.refreshed, report.failed, report.skipped
            );
        }
    }
    Ok(())
}

fn print_credentials(credentials: &[Credential]) {
    println!(
        "{:<18} {:<14} {:<8} {:<9} {:>8} {:>9} {:>9}",
        "ID", "NAME", "TIER", "STATE", "QUOTA", "REQUESTS", "FAILURES"
    );
    for c in credentials {
        println!(
            "{:<18} {:<14} {:<8} {:<9} {:>8} {:>9} {:>9}",
            c.id.as_str(),
            c.name,
            c.tier.to_string(),
            c.state.to_string(),
            c.remaining_quota,
            c.request_count,
            c.failure_count
        );
        if let Some(reason) = &c.cooldown_reason {
            println!("  └─ {reason}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use relay_core::{ManualClock, MemoryStore, RelayConfig, ScriptedUpstream, Tier};

    fn offline_relay() -> RequestOrchestrator {
        RequestOrchestrator::builder(RelayConfig::default())
            .upstream(Arc::new(ScriptedUpstream::new()))
            .state_store(Arc::new(MemoryStore::new()))
            .clock(Arc::new(ManualClock::default()))
            .build()
            .unwrap()
    }

    fn chat_args(message: &str) -> ChatArgs {
        ChatArgs {
            message: message.into(),
            model: "grok-3".into(),
            system: Some("be brief".into()),
            conversation: None,
            stream: false,
            sse: false,
        }
    }

    #[test]
    fn test_request_from_args() {
        let mut args = chat_args("hi");
        args.conversation = Some("h-9".into());
        args.stream = true;
        let request = build_request(&args);
        assert_eq!(request.messages.len(), 2);
        assert!(request.stream);
        assert_eq!(request.conversation_id, Some(ConversationHandle::from("h-9")));
        assert_eq!(request.latest_user_message().unwrap().text(), "hi");
    }

    #[tokio::test]
    async fn test_write_frame_text_only() {
        let mut out = Vec::new();
        write_frame(&mut out, &StreamFrame::TextDelta("Hel".into()))
            .await
            .unwrap();
        write_frame(&mut out, &StreamFrame::TextDelta("lo".into()))
            .await
            .unwrap();
        write_frame(&mut out, &StreamFrame::Done).await.unwrap();
        assert_eq!(out, b"Hello\n");
    }

    #[tokio::test]
    async fn test_offline_chat_and_credentials() {
        let relay = offline_relay();
        relay
            .add_credential("secret-offline-0123456789", "offline", Tier::Free)
            .unwrap();
        chat(&relay, chat_args("hello")).await.unwrap();
        assert_eq!(relay.store().len(), 1);
        assert_eq!(relay.stats().metrics().successes.get(), 1);
    }

    #[tokio::test]
    async fn test_remove_unknown_credential_fails() {
        let relay = offline_relay();
        let err = credentials(
            &relay,
            CredentialAction::Remove {
                id: "missing".into(),
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
