use std::cell::Cell;
use std::rc::Rc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use message_loop::{
    BasicMessage, ConflatableMessage, HandlerRef, HookRef, LocalTaskScheduler, LoopConfig,
    Message, MessageHandler, MessageLoop,
};

/// A panel that repaints on "update-request" and counts its repaints.
struct Panel {
    name: &'static str,
    repaints: Cell<u32>,
}

impl MessageHandler for Panel {
    fn process_message(&self, msg: &dyn Message) -> Result<()> {
        match msg.msg_type() {
            "update-request" => {
                self.repaints.set(self.repaints.get() + 1);
                info!(panel = self.name, repaints = self.repaints.get(), "repainted");
            }
            "close-request" => anyhow::bail!("{} refuses to close while dirty", self.name),
            other => info!(panel = self.name, msg_type = other, "ignored"),
        }
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("message_loop=info".parse()?))
        .init();

    info!("Message loop demo starting...");

    let config = LoopConfig::from_env();
    config.log_summary();

    let panel = Rc::new(Panel {
        name: "editor",
        repaints: Cell::new(0),
    });
    let handler: HandlerRef = panel.clone();

    let ml = MessageLoop::with_config(LocalTaskScheduler, config);

    let audit: HookRef = Rc::new(|_: &HandlerRef, msg: &dyn Message| -> Result<bool> {
        info!(msg_type = msg.msg_type(), "audit hook saw message");
        Ok(true)
    });
    ml.install_message_hook(&handler, audit.clone());

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            for _ in 0..5 {
                ml.post_message(&handler, Box::new(ConflatableMessage::new("update-request")));
            }
            ml.post_message(&handler, Box::new(BasicMessage::new("activate-request")));
            ml.send_message(&handler, &BasicMessage::new("close-request"));

            while ml.is_run_scheduled() {
                tokio::task::yield_now().await;
            }

            // Hook cleanup is scheduled too, so tear down inside the LocalSet.
            ml.remove_message_hook(&handler, &audit);
            ml.clear_data(&handler);
        })
        .await;
    local.await;

    let stats = ml.stats();
    info!(
        repaints = panel.repaints.get(),
        posted = stats.posted,
        conflated = stats.conflated,
        delivered = stats.delivered,
        handler_faults = stats.handler_faults,
        "Message loop demo finished"
    );

    Ok(())
}
