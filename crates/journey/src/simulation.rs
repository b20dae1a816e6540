//! Hourly replay of historical journeys.
//!
//! Each reference gets its own [`HourlyClock`] spanning its start and end
//! timestamps; the plan is run once per tick until the journey completes
//! or the window closes. Journeys still open at the end are closed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use waypoint_core::codec::decode_datetime;
use waypoint_store::{Broker, Client, MemoryBroker, MemoryClient};

use crate::clock::{Clock, HourlyClock};
use crate::driver::Driver;
use crate::error::{EngineError, EngineResult};
use crate::plan::{Plan, RunStatus};
use crate::source::TableSource;
use crate::types::display_value;

const TICKS_PER_DAY: usize = 24;

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationEntry {
    pub reference: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// What happened to one journey during a replay.
#[derive(Debug, Clone, PartialEq)]
pub struct JourneyReplay {
    pub reference: String,
    pub ticks: usize,
    pub last_status: RunStatus,
    /// False when the journey was closed because its window ran out.
    pub completed_by_plan: bool,
}

pub struct Simulation {
    client: Arc<dyn Client>,
    broker: Arc<dyn Broker>,
    source: String,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("source", &self.source)
            .finish()
    }
}

impl Simulation {
    pub fn new(client: Arc<dyn Client>, broker: Arc<dyn Broker>, source: impl Into<String>) -> Self {
        Self {
            client,
            broker,
            source: source.into(),
        }
    }

    pub fn in_memory(source: impl Into<String>) -> Self {
        Self::new(
            Arc::new(MemoryClient::new()),
            Arc::new(MemoryBroker::new()),
            source,
        )
    }

    pub fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }

    /// Build entries from reference rows carrying start and end timestamps.
    pub fn entries_from_table(
        table: &TableSource,
        start_field: &str,
        end_field: &str,
    ) -> EngineResult<Vec<SimulationEntry>> {
        table
            .rows()
            .iter()
            .map(|row| {
                let reference = row
                    .get(table.reference_field())
                    .map(display_value)
                    .ok_or_else(|| {
                        EngineError::Config(format!(
                            "Row without reference field '{}'",
                            table.reference_field()
                        ))
                    })?;
                let timestamp = |field: &str| {
                    row.get(field).and_then(decode_datetime).ok_or_else(|| {
                        EngineError::Config(format!(
                            "Row '{reference}' has no timestamp in '{field}'"
                        ))
                    })
                };
                Ok(SimulationEntry {
                    start: timestamp(start_field)?,
                    end: timestamp(end_field)?,
                    reference,
                })
            })
            .collect()
    }

    pub fn run(&self, plan: &Plan, entries: &[SimulationEntry]) -> EngineResult<Vec<JourneyReplay>> {
        let replays = entries
            .iter()
            .map(|entry| self.run_journey(plan, entry))
            .collect::<EngineResult<Vec<_>>>()?;
        info!(journeys = replays.len(), "Simulation complete");
        Ok(replays)
    }

    pub fn run_journey(&self, plan: &Plan, entry: &SimulationEntry) -> EngineResult<JourneyReplay> {
        let clock = Clock::Hourly(HourlyClock::new(entry.start, entry.end));
        let mut driver = Driver::find_or_create(
            &entry.reference,
            &self.source,
            self.client.clone(),
            self.broker.clone(),
            clock,
        )?;

        let mut ticks = 0;
        let mut last_status = RunStatus::AlreadyComplete;
        while !driver.clock().has_ended() {
            if ticks % TICKS_PER_DAY == 0 {
                info!(
                    journey = %entry.reference,
                    day = ticks / TICKS_PER_DAY,
                    timestamp = %driver.timestamp(),
                    "**** DAY"
                );
            }
            last_status = plan.run(&mut driver)?;
            ticks += 1;
            if driver.journey().complete {
                break;
            }
            driver.clock_mut().advance();
        }

        let completed_by_plan = driver.journey().complete;
        if !completed_by_plan {
            info!(journey = %entry.reference, "Journey window ended");
            driver.complete_journey()?;
        }

        Ok(JourneyReplay {
            reference: entry.reference.clone(),
            ticks,
            last_status,
            completed_by_plan,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::source::Source;
    use crate::step::{Step, StepRef};
    use crate::types::Record;
    use serde_json::json;
    use waypoint_core::StepStatus;

    fn at(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text).unwrap().with_timezone(&Utc)
    }

    fn entry(reference: &str) -> SimulationEntry {
        SimulationEntry {
            reference: reference.into(),
            start: at("2021-03-01T08:30:00Z"),
            end: at("2021-03-01T10:10:00Z"),
        }
    }

    #[test]
    fn test_pause_resumes_on_next_tick() {
        let mut plan = Plan::new("Pause");
        plan.add_step(Step::start("admission", "Admission", StepRef::new("hold")))
            .add_step(Step::pause("hold", "Hold", StepRef::new("done")))
            .add_step(Step::end("done", "Done"));

        let simulation = Simulation::in_memory("admissions");
        let replay = simulation.run_journey(&plan, &entry("A1")).unwrap();
        assert_eq!(replay.ticks, 2);
        assert!(replay.completed_by_plan);
        assert_eq!(replay.last_status, RunStatus::Completed);

        let journey = simulation
            .client()
            .get_journey("A1", "admissions")
            .unwrap()
            .unwrap();
        let done = simulation.client().get_step(journey.id, "done").unwrap().unwrap();
        assert_eq!(done.status, StepStatus::Complete);
        assert_eq!(done.timestamp, Some(at("2021-03-01T08:00:00Z")));
    }

    #[test]
    fn test_window_end_closes_journey() {
        let mut plan = Plan::new("Waiting");
        plan.add_step(Step::start("admission", "Admission", StepRef::new("labs")))
            .add_step(Step::pre("labs", "Labs", StepRef::new("done")).with_source("labs"))
            .add_step(Step::end("done", "Done"))
            .add_source("labs", Source::broker("Labs", "labs"));

        let simulation = Simulation::in_memory("admissions");
        let replays = simulation.run(&plan, &[entry("A1")]).unwrap();
        assert_eq!(replays[0].ticks, 5);
        assert!(!replays[0].completed_by_plan);
        assert!(matches!(replays[0].last_status, RunStatus::Waiting { .. }));
        let journey = simulation
            .client()
            .get_journey("A1", "admissions")
            .unwrap()
            .unwrap();
        assert!(journey.complete);
    }

    #[test]
    fn test_entries_from_table() {
        let rows: Vec<Record> = vec![json!({
            "adm_id": 7,
            "admitted": "2021-03-01T08:30:00Z",
            "discharged": "2021-03-02 10:00:00"
        })
        .as_object()
        .cloned()
        .unwrap()];
        let table = TableSource::new(rows, "adm_id", None);
        let entries = Simulation::entries_from_table(&table, "admitted", "discharged").unwrap();
        assert_eq!(entries[0].reference, "7");
        assert_eq!(entries[0].end, at("2021-03-02T10:00:00Z"));

        assert!(Simulation::entries_from_table(&table, "admitted", "missing").is_err());
    }
}
