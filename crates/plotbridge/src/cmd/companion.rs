use plotbridge_session::{CompanionClient, CompanionEvent, HandshakeConfig};
use tracing::{debug, info};

use crate::cmd::CompanionArgs;
use crate::exit::{session_error, CliResult, SUCCESS};
use crate::output::{print_batch, OutputFormat};

/// Print every batch and echo `send_back` buffers unchanged until `exit`.
pub fn run(args: CompanionArgs, format: OutputFormat) -> CliResult<i32> {
    let config = HandshakeConfig {
        token: args.token,
        ..HandshakeConfig::default()
    };
    let mut client =
        CompanionClient::connect(&args.endpoint, args.reply_endpoint.as_deref(), &config)
            .map_err(|err| session_error("attach failed", err))?;
    info!(session_id = %client.session_id(), duplex = client.is_duplex(), "attached");

    loop {
        let event = client
            .next_event()
            .map_err(|err| session_error("receive failed", err))?;

        let batch = match event {
            CompanionEvent::Batch(batch) => batch,
            CompanionEvent::Exit => {
                info!(batches = client.batches_received(), "exit received");
                return Ok(SUCCESS);
            }
        };

        print_batch(&batch, client.batches_received(), client.session_id(), format);

        for binding in batch.reply_requests() {
            client
                .send_reply(binding.name(), &binding.payload)
                .map_err(|err| session_error("reply failed", err))?;
            debug!(name = binding.name(), "echoed");
        }
    }
}
