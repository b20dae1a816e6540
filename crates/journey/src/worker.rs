use std::sync::Arc;

use tracing::{debug, warn};
use waypoint_core::BrokerMessage;
use waypoint_store::{Broker, Client, MessageHandler};

use crate::clock::Clock;
use crate::driver::Driver;
use crate::error::EngineResult;
use crate::plan::{Plan, RunStatus};

/// Runs a plan for the journey named by each incoming broker message.
pub struct JourneyWorker {
    plan: Arc<Plan>,
    client: Arc<dyn Client>,
    broker: Arc<dyn Broker>,
    source: String,
    clock: Clock,
}

impl std::fmt::Debug for JourneyWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JourneyWorker")
            .field("plan", &self.plan.title)
            .field("source", &self.source)
            .finish()
    }
}

impl JourneyWorker {
    pub fn new(
        plan: Arc<Plan>,
        client: Arc<dyn Client>,
        broker: Arc<dyn Broker>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            plan,
            client,
            broker,
            source: source.into(),
            clock: Clock::Local,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Find or create the journey, then run the plan. A message whose data
    /// type is watched by the plan restarts the chain at that step.
    pub fn process(&self, message: &BrokerMessage) -> EngineResult<RunStatus> {
        let mut driver = Driver::find_or_create(
            &message.reference,
            &self.source,
            self.client.clone(),
            self.broker.clone(),
            self.clock.clone(),
        )?;

        let status = if self.plan.watches(&message.data_type) {
            self.plan.run_from(&message.data_type, &mut driver)?
        } else {
            self.plan.run(&mut driver)?
        };
        metrics::counter!("journey.worker.messages").increment(1);

        match &status {
            RunStatus::Waiting { step, .. } => {
                warn!(journey = %message.reference, step = %step, "Data not available");
            }
            RunStatus::Invalid { step, reason } => {
                warn!(journey = %message.reference, step = %step, reason = %reason, "Data invalid");
            }
            other => {
                debug!(journey = %message.reference, data_type = %message.data_type, status = ?other, "Message processed");
            }
        }
        Ok(status)
    }
}

impl MessageHandler for JourneyWorker {
    fn handle(&self, message: BrokerMessage) -> anyhow::Result<()> {
        self.process(&message)?;
        Ok(())
    }
}
