//! Simulates concurrent streamed generations on one thread while a reader
//! polls the live view, then prints the persisted history.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use futures::StreamExt as _;
use serde_json::json;
use threadline_core::observability::init_observability;
use threadline_core::{
    AddMessagesOptions, ContentPart, LedgerConfig, MemoryStore, MemoryStoreConfig, MessageDoc,
    MessageFilters, MessageLedger, MessageStatus, NewMessage, NewStream, NewThread,
    PaginationOpts, Role, SortOrder, StreamState, TextStreamPart, ThreadId, combine_messages,
    sync_streams,
};
use threadline_stream::{Chunking, DeltaStreamer, StreamerConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Stream simulated generations into a thread and watch them merge")]
struct Args {
    /// Number of generations running at the same time.
    #[arg(long, default_value_t = 2)]
    generations: usize,
    /// Delay between generated parts, in milliseconds.
    #[arg(long, default_value_t = 40)]
    part_delay_ms: u64,
    /// Reader poll interval, in milliseconds.
    #[arg(long, default_value_t = 120)]
    poll_ms: u64,
    /// Overrides THREADLINE_STREAM_CHUNKING (none, word, line, regex:<pattern>).
    #[arg(long)]
    chunking: Option<String>,
    /// Page size used when printing the final history.
    #[arg(long, default_value_t = 4)]
    page_size: usize,
}

type Ledger = MessageLedger<MemoryStore>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_observability();
    let args = Args::parse();

    let mut streamer_config = StreamerConfig::from_env()?;
    if let Some(raw) = &args.chunking {
        streamer_config = streamer_config.chunking(Chunking::parse(raw)?);
    }

    let store = Arc::new(MemoryStore::with_config(MemoryStoreConfig::from_env()));
    let ledger = MessageLedger::with_config(Arc::clone(&store), LedgerConfig::from_env());
    let thread = ledger
        .create_thread(NewThread::default().title("weather demo"))
        .await?;
    info!(thread_id = %thread.id, generations = args.generations, "starting demo");

    let mut generations = Vec::with_capacity(args.generations);
    for index in 0..args.generations {
        generations.push(tokio::spawn(generate(
            ledger.clone(),
            Arc::clone(&store),
            thread.id.clone(),
            streamer_config.clone(),
            index,
            Duration::from_millis(args.part_delay_ms),
        )));
    }

    let reader = tokio::spawn(watch(
        ledger.clone(),
        Arc::clone(&store),
        thread.id.clone(),
        Duration::from_millis(args.poll_ms),
    ));

    for generation in generations {
        generation.await.context("generation task panicked")??;
    }
    reader.abort();

    print_history(&ledger, &thread.id, args.page_size).await
}

const CITIES: [&str; 4] = ["Oslo", "Lima", "Kyoto", "Accra"];

/// One user turn followed by a streamed tool round-trip and a final answer.
async fn generate(
    ledger: Ledger,
    store: Arc<MemoryStore>,
    thread_id: ThreadId,
    config: StreamerConfig,
    index: usize,
    part_delay: Duration,
) -> anyhow::Result<()> {
    let city = CITIES[index % CITIES.len()];
    let call_id = format!("call-{index}");
    let added = ledger
        .add_messages(
            &thread_id,
            vec![NewMessage::user_text(format!("What is the weather in {city}?"))],
            AddMessagesOptions::default().add_pending(true),
        )
        .await?;
    let pending = added
        .pending
        .context("ledger did not return a pending placeholder")?;

    let metadata = NewStream {
        thread_id: thread_id.clone(),
        order: pending.order,
        step_order: pending.step_order,
        agent_name: Some(format!("agent-{index}")),
        ..NewStream::default()
    };
    let mut streamer = DeltaStreamer::new(store, metadata, config);

    let forecast = json!({"city": city, "sky": "rain", "celsius": 9 + index});
    let answer = format!("It is raining in {city} today, bring an umbrella.");
    let parts = vec![
        TextStreamPart::text("Let me check the forecast. "),
        TextStreamPart::ToolCallStreamingStart {
            tool_call_id: call_id.clone(),
            tool_name: "forecast".into(),
        },
        TextStreamPart::ToolCallDelta {
            tool_call_id: call_id.clone(),
            tool_name: "forecast".into(),
            args_text_delta: format!("{{\"city\":\"{city}\"}}"),
        },
        TextStreamPart::tool_call(call_id.clone(), "forecast", json!({"city": city})),
        TextStreamPart::tool_result(call_id.clone(), "forecast", forecast.clone()),
    ]
    .into_iter()
    .chain(answer.split_inclusive(' ').map(TextStreamPart::text));
    let paced = futures::stream::iter(parts).then(|part| async move {
        tokio::time::sleep(part_delay).await;
        part
    });
    streamer.consume(paced).await?;

    let call = ledger
        .update_message(
            &pending.id,
            vec![
                ContentPart::text("Let me check the forecast. "),
                ContentPart::tool_call(call_id.clone(), "forecast", json!({"city": city})),
            ],
        )
        .await?;
    let steps = ledger
        .add_steps(
            &call.id,
            vec![
                NewMessage::new(
                    Role::Tool,
                    vec![ContentPart::tool_result(call_id, "forecast", forecast)],
                ),
                NewMessage::assistant_text(answer),
            ],
            false,
        )
        .await?;

    let finalized: Vec<MessageDoc> = std::iter::once(call).chain(steps).collect();
    let next = streamer.finish(&finalized).await?;
    info!(index, next = ?next, "generation finished");
    Ok(())
}

/// Polls live streams and prints the combined view whenever it changes.
async fn watch(ledger: Ledger, store: Arc<MemoryStore>, thread_id: ThreadId, every: Duration) {
    let mut prior: Vec<Arc<StreamState>> = Vec::new();
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let synced = match sync_streams(store.as_ref(), &thread_id, &prior, &[]).await {
            Ok(synced) => synced,
            Err(err) => {
                tracing::warn!(error = %err, "stream sync failed");
                continue;
            }
        };
        prior = synced.streams;
        if !synced.changed {
            continue;
        }
        let persisted = ledger
            .get_chat_messages(
                &thread_id,
                &MessageFilters::default()
                    .statuses([MessageStatus::Success, MessageStatus::Pending])
                    .sort(SortOrder::Asc),
                &PaginationOpts::default(),
            )
            .await
            .map(|page| page.messages)
            .unwrap_or_default();
        println!("--- live view ---");
        for message in combine_messages(&persisted, &synced.messages) {
            print_message(&message);
        }
    }
}

async fn print_history(ledger: &Ledger, thread_id: &ThreadId, page_size: usize) -> anyhow::Result<()> {
    println!("=== persisted history (newest first, {page_size} per page) ===");
    let filters = MessageFilters::default();
    let mut pagination = PaginationOpts::first(page_size);
    let mut page_number = 1;
    loop {
        let page = ledger
            .get_chat_messages(thread_id, &filters, &pagination)
            .await?;
        println!("--- page {page_number} ---");
        for message in &page.messages {
            print_message(message);
        }
        if page.is_done {
            return Ok(());
        }
        pagination = PaginationOpts::after(page.continue_cursor, page_size);
        page_number += 1;
    }
}

fn print_message(message: &MessageDoc) {
    let summary = if message.text.is_empty() {
        message
            .content
            .iter()
            .map(|part| match part {
                ContentPart::ToolCall { tool_name, .. } => format!("[call {tool_name}]"),
                ContentPart::ToolResult { result, .. } => format!("[result {result}]"),
                ContentPart::Reasoning { text } => format!("[thinking {text}]"),
                ContentPart::Text { text } => text.clone(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        message.text.clone()
    };
    println!(
        "({:>2},{:>2}) {:<9} {:<7} {}",
        message.order,
        message.step_order,
        format!("{:?}", message.role).to_lowercase(),
        format!("{:?}", message.status).to_lowercase(),
        summary
    );
}
