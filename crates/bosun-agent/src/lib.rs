//! The agent loop.
//!
//! One logical worker bridges the message bus, the durable queue, and the
//! plan runner:
//!
//! 1. a pending result on disk is published and its folder removed;
//! 2. otherwise a pending plan is executed and its result persisted;
//! 3. otherwise the bus is polled (5 s) for the next incoming plan.
//!
//! Incoming messages are validated, persisted, and only then acknowledged —
//! a crash between persist and ack re-delivers the message and the stamp
//! check suppresses the duplicate. Plans that fail validation are answered
//! immediately with an error envelope. Any step failure is logged and
//! retried after 5 s; bus failures reconnect with exponential backoff.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use bosun_bus::{BusClient, BusConfig, InboundMessage, Subscription};
use bosun_config::Config;
use bosun_exec::ExecutorRegistry;
use bosun_queue::{PlanQueue, QueuedPlan};
use bosun_runner::{PlanRunner, into_agent_error};
use bosun_sign::SignatureVerifier;
use bosun_types::ExecutionResult;

/// How long one bus poll waits for a message.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);
/// Sleep after a failed loop step.
const RETRY_DELAY: Duration = Duration::from_secs(5);
/// Reconnect backoff bounds and growth factor.
const BACKOFF_START: Duration = Duration::from_secs(5);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const BACKOFF_FACTOR: f64 = 1.2;

/// What the ingest path decided about one incoming message.
#[derive(Debug)]
pub enum IngestOutcome {
    /// The plan was persisted under this queue timestamp.
    Stored { timestamp: String },
    /// Validation failed; the envelope (if one could be built) must be
    /// published immediately.
    Rejected {
        envelope: Option<ExecutionResult>,
    },
    /// The body was not a JSON document; nothing to do beyond the ack.
    Ignored,
}

/// Validate an incoming plan document and persist it on success.
///
/// `ID`/`ReplyTo` defaults are taken from the AMQP message metadata. The raw
/// body bytes are what gets persisted — the signature covers them exactly as
/// delivered.
pub fn ingest_document(
    queue: &mut PlanQueue,
    raw: &[u8],
    body: Option<&Value>,
    message_id: &str,
    reply_to: Option<&str>,
    signature: Option<&[u8]>,
) -> Result<IngestOutcome> {
    let Some(doc) = body.filter(|body| body.is_object()) else {
        return Ok(IngestOutcome::Ignored);
    };

    let mut doc = doc.clone();
    if doc.get("ID").is_none() && !message_id.is_empty() {
        doc["ID"] = Value::String(message_id.to_string());
    }
    if doc.get("ReplyTo").is_none()
        && let Some(reply_to) = reply_to
    {
        doc["ReplyTo"] = Value::String(reply_to.to_string());
    }

    match bosun_validate::validate(&doc) {
        Ok(()) => {
            let timestamp = queue.put(raw, signature, message_id, reply_to)?;
            Ok(IngestOutcome::Stored { timestamp })
        }
        Err(agent_error) => {
            warn!(code = agent_error.code, error = %agent_error, "rejecting invalid plan");
            let plan_id = doc.get("ID").and_then(Value::as_str);
            let envelope = match ExecutionResult::from_error(&agent_error, plan_id) {
                Ok(mut envelope) => {
                    envelope.reply_to = doc
                        .get("ReplyTo")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    Some(envelope)
                }
                Err(_) => {
                    warn!("execution result is not produced: plan has no ID");
                    None
                }
            };
            Ok(IngestOutcome::Rejected { envelope })
        }
    }
}

/// Pick the routing key for a result: the envelope's `ReplyTo` when dynamic
/// result queues are enabled, the configured key otherwise.
pub fn result_routing_key<'a>(config: &'a Config, result: &'a Value) -> &'a str {
    if config.dynamic_result_queue()
        && let Some(reply_to) = result.get("ReplyTo").and_then(Value::as_str)
    {
        return reply_to;
    }
    &config.rabbitmq().result_routing_key
}

/// Owns the bus connection and subscription, reconnecting with backoff.
struct Pump {
    bus_config: BusConfig,
    input_queue: String,
    client: Option<BusClient>,
    subscription: Option<Subscription>,
    delay: Duration,
}

impl Pump {
    fn new(config: &Config) -> Self {
        let rabbit = config.rabbitmq();
        Self {
            bus_config: BusConfig {
                login: rabbit.login.clone(),
                password: rabbit.password.clone(),
                host: rabbit.host.clone(),
                port: rabbit.port,
                virtual_host: rabbit.virtual_host.clone(),
                ssl: rabbit.ssl,
                ssl_version: rabbit.ssl_version().map(str::to_string),
                ca_certs: rabbit.ca_certs().map(str::to_string),
                insecure: rabbit.insecure,
            },
            input_queue: rabbit.input_queue.clone(),
            client: None,
            subscription: None,
            delay: BACKOFF_START,
        }
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if let Some(client) = &self.client
            && !client.is_broken()
        {
            return Ok(());
        }

        self.subscription = None;
        let client = BusClient::connect(&self.bus_config).await?;
        client.declare(&self.input_queue, "", false, 0).await?;
        self.subscription = Some(client.subscribe(&self.input_queue, 1).await?);
        self.client = Some(client);
        info!(queue = %self.input_queue, "subscribed to the input queue");
        Ok(())
    }

    fn disconnect(&mut self) {
        self.subscription = None;
        self.client = None;
    }

    /// A connected client for publishing, reconnecting first if needed.
    async fn client(&mut self) -> Result<&BusClient> {
        self.ensure_connected().await?;
        Ok(self.client.as_ref().expect("connected above"))
    }

    /// Poll for one message and run it through ingest. Returns after at most
    /// one message (or one empty poll timeout). Communication failures are
    /// retried here with exponential backoff.
    async fn poll(&mut self, queue: &mut PlanQueue, config: &Config) -> Result<()> {
        loop {
            match self.try_poll(queue, config).await {
                Ok(()) => {
                    self.delay = BACKOFF_START;
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "communication error");
                    self.disconnect();
                    tokio::time::sleep(self.delay).await;
                    let grown = self.delay.mul_f64(BACKOFF_FACTOR);
                    self.delay = grown.min(BACKOFF_CAP);
                }
            }
        }
    }

    async fn try_poll(&mut self, queue: &mut PlanQueue, config: &Config) -> Result<()> {
        self.ensure_connected().await?;
        let subscription = self.subscription.as_mut().expect("connected above");

        let Some(message) = subscription.next_message(POLL_TIMEOUT).await? else {
            return Ok(());
        };

        let client = self.client.as_ref().expect("connected above");
        handle_message(message, queue, config, client).await
    }
}

/// Run one message through ingest, publish a rejection envelope when needed,
/// and ack. The ack only happens after the plan is safely on disk (or its
/// rejection is on its way back), so a crash here re-delivers.
async fn handle_message(
    message: InboundMessage,
    queue: &mut PlanQueue,
    config: &Config,
    client: &BusClient,
) -> Result<()> {
    let outcome = ingest_document(
        queue,
        &message.raw,
        message.body.as_ref(),
        &message.id,
        message.reply_to.as_deref(),
        message.signature.as_deref(),
    )?;

    match &outcome {
        IngestOutcome::Stored { timestamp } => {
            debug!(timestamp = %timestamp, "plan accepted");
        }
        IngestOutcome::Rejected {
            envelope: Some(envelope),
        } => {
            publish_result(client, config, &envelope.to_value()).await?;
        }
        IngestOutcome::Rejected { envelope: None } | IngestOutcome::Ignored => {}
    }

    message.ack().await?;
    Ok(())
}

async fn publish_result(client: &BusClient, config: &Config, result: &Value) -> Result<()> {
    let routing_key = result_routing_key(config, result);
    let message_id = result
        .get("SourceID")
        .and_then(Value::as_str)
        .unwrap_or_default();
    client
        .publish(
            result,
            message_id,
            routing_key,
            &config.rabbitmq().result_exchange,
        )
        .await
        .context("failed to publish execution result")
}

/// The deployment agent.
pub struct Agent {
    config: Config,
    queue: PlanQueue,
    registry: ExecutorRegistry,
}

impl Agent {
    /// Build the agent: open the durable queue (with signature verification
    /// when an engine key is configured) and register the builtin executors.
    pub fn new(config: Config) -> Result<Self> {
        let verifier = config
            .engine_key()
            .map(|pem| SignatureVerifier::from_pem(pem, &config.rabbitmq().input_queue))
            .transpose()
            .context("failed to load the engine key")?;
        let queue = PlanQueue::open(&config.storage(), verifier)?;

        Ok(Self {
            config,
            queue,
            registry: ExecutorRegistry::builtin(),
        })
    }

    /// Run the loop forever. Requires the multi-threaded runtime: plan
    /// execution blocks its worker for the duration of the plan.
    pub async fn run(&mut self) -> Result<()> {
        let mut pump = Pump::new(&self.config);
        info!(storage = %self.config.storage().display(), "bosun agent started");

        loop {
            if let Err(e) = self.step(&mut pump).await {
                error!(error = %format!("{e:#}"), "loop step failed");
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }

    /// One scheduling decision: result out, else plan run, else poll.
    async fn step(&mut self, pump: &mut Pump) -> Result<()> {
        if let Some((result, timestamp)) = self.queue.peek_result()? {
            let client = pump.client().await?;
            publish_result(client, &self.config, &result).await?;
            self.queue.remove(&timestamp)?;
            return Ok(());
        }

        if let Some(queued) = self.queue.peek_plan()? {
            tokio::task::block_in_place(|| self.run_plan(queued))?;
            return Ok(());
        }

        pump.poll(&mut self.queue, &self.config).await
    }

    /// Execute one plan and persist its result envelope next to it.
    pub fn run_plan(&mut self, queued: QueuedPlan) -> Result<()> {
        let plan_id = queued.plan.id.clone();
        info!(plan = plan_id.as_deref().unwrap_or("<unnamed>"), "running execution plan");

        let envelope = match PlanRunner::new(
            queued.plan.clone(),
            &self.config.storage(),
            &self.registry,
        ) {
            Ok(mut runner) => {
                let outcome = runner.execute();
                runner.dispose();
                match outcome {
                    Ok(value) => ExecutionResult::from_result(value, plan_id.as_deref()),
                    Err(agent_error) => {
                        warn!(code = agent_error.code, error = %agent_error, "execution plan failed");
                        ExecutionResult::from_error(&agent_error, plan_id.as_deref())
                    }
                }
            }
            Err(e) => {
                let agent_error = into_agent_error(e);
                warn!(error = %agent_error, "could not prepare execution plan");
                ExecutionResult::from_error(&agent_error, plan_id.as_deref())
            }
        };

        match envelope {
            Ok(envelope) => self.queue.put_result(&envelope, &queued)?,
            Err(_) => {
                // No envelope can be built without a plan ID; drop the
                // record rather than wedge the queue on it forever.
                warn!("execution result is not produced: plan has no ID");
                self.queue.remove(&queued.timestamp)?;
            }
        }
        Ok(())
    }

    /// Direct access to the durable queue (tests and diagnostics).
    pub fn queue_mut(&mut self) -> &mut PlanQueue {
        &mut self.queue
    }
}
