//! End-to-end relay scenarios against mock providers.
//!
//! Each test spins up its own relay instance plus three in-process
//! mocks: a scripted streaming-ASR WebSocket server, a translation
//! endpoint, and a synthesis endpoint. Clients are plain WebSocket
//! connections driving the public protocol.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use voicebridge::asr::AsrClient;
use voicebridge::mt::Translator;
use voicebridge::pipeline::PipelineManager;
use voicebridge::session::SessionRegistry;
use voicebridge::transport::{self, AppState};
use voicebridge::tts::Synthesizer;
use voicebridge::Config;

/// Messages a mock ASR connection sends in response to the nth binary
/// frame it receives.
type Script = Vec<Vec<String>>;

fn transcript(text: &str, confidence: f64, is_final: bool) -> String {
    serde_json::json!({
        "type": "transcript",
        "text": text,
        "confidence": confidence,
        "isFinal": is_final,
    })
    .to_string()
}

fn provider_error(code: &str, message: &str) -> String {
    serde_json::json!({
        "type": "error",
        "code": code,
        "message": message,
    })
    .to_string()
}

// ── Mock streaming ASR ────────────────────────────────────────────

/// Scripted streaming recognizer. Scripts are keyed by language (taken
/// from the configuration frame); each language holds one script per
/// successive connection.
async fn spawn_mock_asr(scripts: HashMap<String, Vec<Script>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let scripts = Arc::new(scripts);
    let per_language_conns: Arc<parking_lot::Mutex<HashMap<String, usize>>> =
        Arc::new(parking_lot::Mutex::new(HashMap::new()));

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let scripts = Arc::clone(&scripts);
            let conns = Arc::clone(&per_language_conns);
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                // First frame is the configuration message.
                let mut script: Script = Vec::new();
                while let Some(Ok(msg)) = ws.next().await {
                    if let WsMessage::Text(text) = msg {
                        let value: serde_json::Value =
                            serde_json::from_str(&text).unwrap_or_default();
                        if value.get("type").and_then(|v| v.as_str()) == Some("config") {
                            let language = value
                                .get("language")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string();
                            let index = {
                                let mut conns = conns.lock();
                                let counter = conns.entry(language.clone()).or_insert(0);
                                let index = *counter;
                                *counter += 1;
                                index
                            };
                            if let Some(per_conn) = scripts.get(&language) {
                                let pick = index.min(per_conn.len().saturating_sub(1));
                                script = per_conn.get(pick).cloned().unwrap_or_default();
                            }
                            break;
                        }
                    }
                }

                let mut frame_index = 0usize;
                while let Some(Ok(msg)) = ws.next().await {
                    match msg {
                        WsMessage::Binary(_) => {
                            if let Some(messages) = script.get(frame_index) {
                                for m in messages {
                                    if ws.send(WsMessage::Text(m.clone())).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            frame_index += 1;
                        }
                        WsMessage::Close(_) => return,
                        _ => {}
                    }
                }
            });
        }
    });

    format!("ws://{addr}")
}

// ── Mock MT / TTS ─────────────────────────────────────────────────

async fn spawn_mock_mt(counter: Arc<AtomicUsize>) -> String {
    async fn handler(
        State(counter): State<Arc<AtomicUsize>>,
        Json(_body): Json<serde_json::Value>,
    ) -> impl IntoResponse {
        counter.fetch_add(1, Ordering::SeqCst);
        Json(serde_json::json!({
            "translations": [{
                "text": "merhaba, nasılsın",
                "detected_source_language": "EN",
            }]
        }))
    }

    let app = axum::Router::new()
        .route("/", post(handler))
        .with_state(counter);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}/")
}

async fn spawn_mock_tts(counter: Arc<AtomicUsize>) -> String {
    async fn handler(State(counter): State<Arc<AtomicUsize>>) -> impl IntoResponse {
        counter.fetch_add(1, Ordering::SeqCst);
        vec![1u8, 2, 3]
    }

    let app = axum::Router::new()
        .route("/{voice}/stream", post(handler))
        .with_state(counter);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

// ── Relay under test ──────────────────────────────────────────────

struct TestRelay {
    ws_url: String,
    mt_count: Arc<AtomicUsize>,
    tts_count: Arc<AtomicUsize>,
}

async fn spawn_relay(asr_scripts: HashMap<String, Vec<Script>>) -> TestRelay {
    let mt_count = Arc::new(AtomicUsize::new(0));
    let tts_count = Arc::new(AtomicUsize::new(0));

    let mut config = Config::default();
    config.asr.primary_ws_url = spawn_mock_asr(asr_scripts).await;
    config.asr.secondary_ws_url = String::new();
    config.asr.batch_url = String::new();
    config.asr.primary_rest_url = String::new();
    config.asr.routing.clear();
    config.mt.base_url = spawn_mock_mt(Arc::clone(&mt_count)).await;
    config.tts.base_url = spawn_mock_tts(Arc::clone(&tts_count)).await;
    let config = Arc::new(config);

    let registry = Arc::new(SessionRegistry::new(
        config.idle.ended_grace,
        config.idle.session,
        config.idle.pending_session,
    ));
    let asr = Arc::new(AsrClient::new(config.asr.clone()));
    let pipelines = Arc::new(PipelineManager::new(
        Arc::clone(&registry),
        asr,
        Arc::new(Translator::new(config.mt.clone())),
        Arc::new(Synthesizer::new(config.tts.clone())),
        config.gate.clone(),
    ));

    let state = AppState {
        registry,
        pipelines,
        config,
    };
    let app = transport::router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    TestRelay {
        ws_url: format!("ws://{addr}/ws"),
        mt_count,
        tts_count,
    }
}

// ── Test client ───────────────────────────────────────────────────

struct Client {
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

impl Client {
    async fn connect(relay: &TestRelay) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(&relay.ws_url)
            .await
            .expect("client connect");
        Self { ws }
    }

    async fn join(&mut self, role: &str, language: &str, voice_id: &str) {
        let msg = serde_json::json!({
            "type": "join-session",
            "role": role,
            "language": language,
            "voiceId": voice_id,
        });
        self.ws
            .send(WsMessage::Text(msg.to_string()))
            .await
            .expect("join send");
    }

    async fn send_audio(&mut self, frame: Vec<u8>) {
        self.ws
            .send(WsMessage::Binary(frame))
            .await
            .expect("audio send");
    }

    /// Next JSON message, skipping heartbeat pings.
    async fn next_message(&mut self) -> serde_json::Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(10), self.ws.next())
                .await
                .expect("timed out waiting for message")
                .expect("connection closed")
                .expect("websocket error");
            if let WsMessage::Text(text) = msg {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                if value["type"] == "ping" {
                    continue;
                }
                return value;
            }
        }
    }

    /// Read messages until one of the wanted type arrives; returns every
    /// message seen, the wanted one last.
    async fn collect_until(&mut self, wanted: &str) -> Vec<serde_json::Value> {
        let mut seen = Vec::new();
        loop {
            let value = self.next_message().await;
            let is_wanted = value["type"] == wanted;
            seen.push(value);
            if is_wanted {
                return seen;
            }
        }
    }

    async fn expect_type(&mut self, wanted: &str) -> serde_json::Value {
        self.collect_until(wanted).await.pop().unwrap()
    }
}

fn no_scripts() -> HashMap<String, Vec<Script>> {
    HashMap::new()
}

fn en_script(script: Script) -> HashMap<String, Vec<Script>> {
    HashMap::from([("en".to_string(), vec![script])])
}

fn pcm_frame() -> Vec<u8> {
    vec![0u8; 3200]
}

// ── Scenarios ─────────────────────────────────────────────────────

#[tokio::test]
async fn pairing_delivers_session_ready_to_both() {
    let relay = spawn_relay(no_scripts()).await;

    let mut a = Client::connect(&relay).await;
    a.join("doctor", "tr", "v_tr").await;
    let waiting = a.expect_type("waiting-for-partner").await;
    assert!(waiting["sessionId"].is_string());

    let mut b = Client::connect(&relay).await;
    b.join("patient", "en", "v_en").await;

    let ready_b = b.expect_type("session-ready").await;
    assert_eq!(ready_b["partnerLanguage"], "tr");
    assert_eq!(ready_b["partnerRole"], "doctor");

    let ready_a = a.expect_type("session-ready").await;
    assert_eq!(ready_a["partnerLanguage"], "en");
    assert_eq!(ready_a["partnerRole"], "patient");
}

#[tokio::test]
async fn same_language_joiners_are_not_paired() {
    let relay = spawn_relay(no_scripts()).await;

    let mut a = Client::connect(&relay).await;
    a.join("doctor", "tr", "v_tr").await;
    a.expect_type("waiting-for-partner").await;

    let mut c = Client::connect(&relay).await;
    c.join("patient", "tr", "v_tr2").await;
    c.expect_type("waiting-for-partner").await;
}

#[tokio::test]
async fn invalid_join_keeps_transport_open() {
    let relay = spawn_relay(no_scripts()).await;

    let mut a = Client::connect(&relay).await;
    a.join("doctor", "klingon", "v_1").await;
    let err = a.expect_type("error").await;
    assert_eq!(err["code"], "validation");

    // Transport still usable: a valid join goes through.
    a.join("doctor", "tr", "v_1").await;
    a.expect_type("waiting-for-partner").await;
}

#[tokio::test]
async fn single_sentence_flows_to_partner_only() {
    let script = vec![vec![
        transcript("hello", 0.5, false),
        transcript("hello, how are you", 0.92, true),
    ]];
    let relay = spawn_relay(en_script(script)).await;

    let mut a = Client::connect(&relay).await;
    a.join("doctor", "tr", "v_tr").await;
    a.expect_type("waiting-for-partner").await;

    let mut b = Client::connect(&relay).await;
    b.join("patient", "en", "v_en").await;
    b.expect_type("session-ready").await;
    a.expect_type("session-ready").await;

    b.send_audio(pcm_frame()).await;

    // The speaker sees its own transcription and a self-tagged
    // translation, then the latency report. It must never hear audio.
    let seen_by_b = b.collect_until("latency-stats").await;
    let transcriptions: Vec<_> = seen_by_b
        .iter()
        .filter(|m| m["type"] == "live-transcription")
        .collect();
    assert!(!transcriptions.is_empty());
    assert!(transcriptions
        .iter()
        .any(|m| m["text"] == "hello, how are you"));
    let translations: Vec<_> = seen_by_b
        .iter()
        .filter(|m| m["type"] == "live-translation")
        .collect();
    assert_eq!(translations.len(), 1, "gate must fire exactly once");
    assert_eq!(translations[0]["speaker"], "self");
    assert_eq!(translations[0]["translatedText"], "merhaba, nasılsın");
    assert!(
        seen_by_b.iter().all(|m| m["type"] != "synthesized-audio"),
        "speaker must never receive synthesized audio"
    );

    // The partner gets the partner-tagged translation and exactly one
    // synthesized-audio message.
    let seen_by_a = a.collect_until("synthesized-audio").await;
    let translations: Vec<_> = seen_by_a
        .iter()
        .filter(|m| m["type"] == "live-translation")
        .collect();
    assert_eq!(translations.len(), 1);
    assert_eq!(translations[0]["speaker"], "partner");
    let audio = seen_by_a.last().unwrap();
    assert_eq!(audio["targetLanguage"], "tr");
    assert_eq!(audio["isFinal"], true);
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(audio["audio"].as_str().unwrap())
        .unwrap();
    assert_eq!(bytes, vec![1, 2, 3]);

    assert_eq!(relay.mt_count.load(Ordering::SeqCst), 1);
    assert_eq!(relay.tts_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn duplicate_final_within_window_is_translated_once() {
    let script = vec![
        vec![transcript("thank you", 0.9, true)],
        vec![transcript("thank you", 0.9, true)],
    ];
    let relay = spawn_relay(en_script(script)).await;

    let mut a = Client::connect(&relay).await;
    a.join("doctor", "tr", "v_tr").await;
    a.expect_type("waiting-for-partner").await;

    let mut b = Client::connect(&relay).await;
    b.join("patient", "en", "v_en").await;
    b.expect_type("session-ready").await;
    a.expect_type("session-ready").await;

    b.send_audio(pcm_frame()).await;
    b.collect_until("latency-stats").await;
    // Second, identical final well inside the dedup window.
    b.send_audio(pcm_frame()).await;
    a.expect_type("synthesized-audio").await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(
        relay.mt_count.load(Ordering::SeqCst),
        1,
        "duplicate utterance must not reach the translator"
    );
    assert_eq!(relay.tts_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn short_message_fires_after_grace_timer() {
    let script = vec![vec![transcript("ok", 0.9, false)]];
    let relay = spawn_relay(en_script(script)).await;

    let mut a = Client::connect(&relay).await;
    a.join("doctor", "tr", "v_tr").await;
    a.expect_type("waiting-for-partner").await;

    let mut b = Client::connect(&relay).await;
    b.join("patient", "en", "v_en").await;
    b.expect_type("session-ready").await;
    a.expect_type("session-ready").await;

    b.send_audio(pcm_frame()).await;
    // Nothing fires immediately; the 3 s short-message timer does.
    let started = std::time::Instant::now();
    let translation = b.expect_type("live-translation").await;
    assert_eq!(translation["originalText"], "ok");
    assert!(
        started.elapsed() >= Duration::from_millis(2500),
        "short message fired before the grace timer"
    );
}

#[tokio::test]
async fn urgency_keyword_skips_the_short_timer() {
    let script = vec![vec![transcript("help", 0.6, false)]];
    let relay = spawn_relay(en_script(script)).await;

    let mut a = Client::connect(&relay).await;
    a.join("doctor", "tr", "v_tr").await;
    a.expect_type("waiting-for-partner").await;

    let mut b = Client::connect(&relay).await;
    b.join("patient", "en", "v_en").await;
    b.expect_type("session-ready").await;
    a.expect_type("session-ready").await;

    let started = std::time::Instant::now();
    b.send_audio(pcm_frame()).await;
    let translation = b.expect_type("live-translation").await;
    assert_eq!(translation["originalText"], "help");
    assert!(
        started.elapsed() < Duration::from_millis(2500),
        "urgent utterance must fire immediately"
    );
}

#[tokio::test]
async fn partner_disconnect_requeues_and_allows_new_pairing() {
    let relay = spawn_relay(no_scripts()).await;

    let mut a = Client::connect(&relay).await;
    a.join("doctor", "tr", "v_tr").await;
    a.expect_type("waiting-for-partner").await;

    let mut b = Client::connect(&relay).await;
    b.join("patient", "en", "v_en").await;
    b.expect_type("session-ready").await;
    a.expect_type("session-ready").await;

    // B drops; A learns about it and goes back to waiting.
    drop(b);
    a.expect_type("partner-disconnected").await;

    // A new English patient pairs with the requeued A.
    let mut b2 = Client::connect(&relay).await;
    b2.join("patient", "en", "v_en2").await;
    let ready = b2.expect_type("session-ready").await;
    assert_eq!(ready["partnerLanguage"], "tr");
    a.expect_type("session-ready").await;
}

#[tokio::test]
async fn stream_timeout_recreates_asr_without_client_error() {
    let scripts = HashMap::from([(
        "en".to_string(),
        vec![
            // First connection: classified timeout on the first frame.
            vec![vec![provider_error("NET-0001", "stream idle timeout")]],
            // Recreated connection: a normal final.
            vec![vec![transcript("hello, how are you", 0.92, true)]],
        ],
    )]);
    let relay = spawn_relay(scripts).await;

    let mut a = Client::connect(&relay).await;
    a.join("doctor", "tr", "v_tr").await;
    a.expect_type("waiting-for-partner").await;

    let mut b = Client::connect(&relay).await;
    b.join("patient", "en", "v_en").await;
    b.expect_type("session-ready").await;
    a.expect_type("session-ready").await;

    // First frame triggers the provider timeout; the handle is recreated
    // transparently.
    b.send_audio(pcm_frame()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    // Next frame lands on the recreated stream and produces a transcript.
    b.send_audio(pcm_frame()).await;

    let seen = b.collect_until("live-translation").await;
    assert!(
        seen.iter().all(|m| m["type"] != "transcription-error"),
        "timeout recreation must be invisible to the client"
    );
}
