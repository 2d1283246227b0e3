//! Background sweeper.
//!
//! One long-lived task on a fixed cadence that (a) closes idle ASR
//! handles, (b) reaps idle synthesis streams, (c) ends idle and expired
//! sessions, (d) drops stale synthesis-cache entries, and (e)
//! garbage-collects ended sessions past their grace window. All
//! thresholds come from [`crate::config::Config`].

use std::sync::Arc;

use crate::asr::AsrClient;
use crate::config::Config;
use crate::pipeline::PipelineManager;
use crate::session::SessionRegistry;
use crate::tts::Synthesizer;

/// Spawn the sweeper. It runs until the process exits.
pub fn spawn(
    registry: Arc<SessionRegistry>,
    pipelines: Arc<PipelineManager>,
    asr: Arc<AsrClient>,
    synthesizer: Arc<Synthesizer>,
    config: Arc<Config>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(config.reaper_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;

            let closed_handles = asr.sweep_idle(config.idle.asr_handle).await;
            if !closed_handles.is_empty() {
                tracing::info!(count = closed_handles.len(), "Closed idle ASR handles");
            }

            let reaped_streams = synthesizer.sweep_idle(config.idle.tts_stream);
            if reaped_streams > 0 {
                tracing::info!(count = reaped_streams, "Reaped idle synthesis streams");
            }
            synthesizer.sweep_cache();

            let outcome = registry.sweep();
            for session_id in &outcome.ended_sessions {
                tracing::info!(session_id = %session_id, "Session reaped");
            }
            for participant in outcome.dropped {
                pipelines.teardown(&participant.id).await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AsrConfig, GateConfig, MtConfig, TtsConfig};
    use crate::language::Language;
    use crate::mt::Translator;
    use crate::session::JoinOutcome;
    use std::time::Duration;

    #[tokio::test]
    async fn reaper_tears_down_expired_pending_sessions() {
        let mut config = Config::default();
        config.reaper_interval = Duration::from_millis(20);
        config.idle.pending_session = Duration::ZERO;
        let config = Arc::new(config);

        let registry = Arc::new(SessionRegistry::new(
            config.idle.ended_grace,
            config.idle.session,
            config.idle.pending_session,
        ));
        let asr = Arc::new(AsrClient::new(AsrConfig {
            primary_ws_url: String::new(),
            secondary_ws_url: String::new(),
            batch_url: String::new(),
            primary_rest_url: "http://127.0.0.1:9/v1/listen".into(),
            ..AsrConfig::default()
        }));
        let pipelines = Arc::new(PipelineManager::new(
            Arc::clone(&registry),
            Arc::clone(&asr),
            Arc::new(Translator::new(MtConfig::default())),
            Arc::new(Synthesizer::new(TtsConfig::default())),
            GateConfig::default(),
        ));

        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let JoinOutcome::Waiting { participant, .. } =
            registry.add_user("doctor", Language::Tr, "v_tr", tx)
        else {
            panic!("expected Waiting");
        };
        pipelines.start_participant(&participant).unwrap();

        let task = spawn(
            Arc::clone(&registry),
            Arc::clone(&pipelines),
            asr,
            Arc::new(Synthesizer::new(TtsConfig::default())),
            config,
        );

        // The expired pending session disappears within a few ticks.
        let mut cleared = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if registry.counts() == (0, 0) && !pipelines.has_runtime(&participant.id) {
                cleared = true;
                break;
            }
        }
        task.abort();
        assert!(cleared, "pending session and pipeline must be reaped");
    }
}
