//! Built-in admission plan over the tables of the source data file:
//! `admissions`, `observations` (timestamped by `recorded_at`) and
//! `discharges`, all keyed by `adm_id`.

use std::sync::Arc;

use serde_json::json;
use waypoint_journey::{
    Action, DbSource, Decision, DecisionCase, Expression, ExpressionAlgorithm, Factor, Operator,
    Plan, Process, ScoreAlgorithm, Source, SourceKind, Step, StepRef, TimeBasedSource,
};

const REFERENCE_FIELD: &str = "adm_id";

fn early_warning_score() -> ScoreAlgorithm {
    ScoreAlgorithm::new(
        "Early warning score",
        vec![
            Factor::new(
                "Systolic BP 90 or less",
                Expression::compare("systolic_bp", Operator::Le, json!(90)),
                3.0,
            ),
            Factor::new(
                "Systolic BP 91-100",
                Expression::between("systolic_bp", json!(91), json!(100)),
                2.0,
            ),
            Factor::new(
                "Pulse over 130",
                Expression::compare("pulse", Operator::Gt, json!(130)),
                3.0,
            ),
            Factor::new(
                "Respiratory rate 25 or more",
                Expression::compare("resp_rate", Operator::Ge, json!(25)),
                3.0,
            ),
            Factor::new(
                "Oxygen saturation 91 or less",
                Expression::compare("spo2", Operator::Le, json!(91)),
                3.0,
            ),
        ],
    )
    .with_required_fields(["systolic_bp", "pulse"])
}

pub fn admission_plan(data_path: &str, watch_messages: &[String]) -> anyhow::Result<Plan> {
    let connection = DbSource::connect(data_path)?;

    let mut plan = Plan::new("Admission");
    plan.add_step(
        Step::start("admission", "Admission", StepRef::new("news"))
            .with_source("admission")
            .with_action(Action::PreRunState {
                label: "location".into(),
                state: "ward".into(),
            }),
    )
    .add_step(
        Step::algorithm(
            "news",
            "Early warning score",
            Arc::new(early_warning_score()),
            Decision::SelectCase {
                cases: vec![DecisionCase::new(
                    Expression::compare("value", Operator::Ge, json!(5)),
                    Some(StepRef::new("escalate")),
                )
                .with_title("High risk")],
                default_step: Some(StepRef::new("observe")),
            },
        )
        .with_source("observations")
        .with_action(Action::ResultStore {
            decision_steps: Vec::new(),
            send_message: true,
        }),
    )
    .add_step(Step::pause("observe", "Observe", StepRef::new("news")))
    .add_step(
        Step::end("escalate", "Escalate to critical care").with_action(Action::PreRunState {
            label: "location".into(),
            state: "critical_care".into(),
        }),
    )
    .add_step(
        Step::check_end(
            "discharged",
            "Discharged",
            Arc::new(ExpressionAlgorithm::new(
                "Discharge recorded",
                Expression::Empty {
                    input_field: "discharged_at".into(),
                    negated: true,
                },
            )),
            StepRef::new("discharge"),
        )
        .with_source("discharges"),
    )
    .add_step(Step::end("discharge", "Discharge"));

    plan.add_source(
        "admission",
        Source::new(
            "Admissions",
            SourceKind::Database(DbSource::table(
                connection.clone(),
                "admissions",
                REFERENCE_FIELD,
            )),
        ),
    )
    .add_source(
        "observations",
        Source::new(
            "Observations",
            SourceKind::TimeBased(TimeBasedSource::new(
                DbSource::table(connection.clone(), "observations", REFERENCE_FIELD),
                "recorded_at",
            )),
        )
        .with_process(Process::ConvertToFloat(vec![
            "systolic_bp".into(),
            "pulse".into(),
            "resp_rate".into(),
            "spo2".into(),
        ])),
    )
    .add_source(
        "discharges",
        Source::new(
            "Discharges",
            SourceKind::Database(DbSource::table(connection, "discharges", REFERENCE_FIELD)),
        ),
    );

    for data_type in watch_messages {
        plan.watch_message(data_type.clone());
    }
    plan.validate()?;
    Ok(plan)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use waypoint_journey::{Clock, Driver, RunStatus};

    fn data_file(dir: &tempfile::TempDir) -> String {
        let path = dir.path().join("data.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE admissions (adm_id TEXT, admitted_at TEXT);
             INSERT INTO admissions VALUES ('A1', '2021-03-01 08:00:00');
             INSERT INTO admissions VALUES ('A2', '2021-03-01 09:00:00');
             CREATE TABLE observations (adm_id TEXT, recorded_at TEXT,
                 systolic_bp TEXT, pulse TEXT, resp_rate TEXT, spo2 TEXT);
             INSERT INTO observations VALUES ('A1', '2021-03-01 08:10:00', '85', '135', '20', '96');
             INSERT INTO observations VALUES ('A2', '2021-03-01 09:10:00', '120', '80', '16', '98');",
        )
        .unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_high_score_escalates() {
        let dir = tempfile::tempdir().unwrap();
        let plan = admission_plan(&data_file(&dir), &[]).unwrap();
        let mut driver = Driver::in_memory("A1", "admissions", Clock::Local).unwrap();

        assert_eq!(plan.run(&mut driver).unwrap(), RunStatus::Completed);
        assert_eq!(
            driver.get_route().unwrap(),
            vec!["admission", "news", "escalate"]
        );
        assert_eq!(
            driver.current_states().unwrap()["location"].state,
            "critical_care"
        );
        assert!(driver.get_broker_data("outcome:news").unwrap().is_some());
    }

    #[test]
    fn test_low_score_observes_until_discharge_appears() {
        let dir = tempfile::tempdir().unwrap();
        let path = data_file(&dir);
        let plan = admission_plan(&path, &[]).unwrap();
        let mut driver = Driver::in_memory("A2", "admissions", Clock::Local).unwrap();

        assert_eq!(
            plan.run(&mut driver).unwrap(),
            RunStatus::Paused {
                step: "observe".into()
            }
        );

        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE discharges (adm_id TEXT, discharged_at TEXT);
             INSERT INTO discharges VALUES ('A2', '2021-03-02 10:00:00');",
        )
        .unwrap();
        assert_eq!(plan.run(&mut driver).unwrap(), RunStatus::Completed);
        assert_eq!(
            driver.get_route().unwrap(),
            vec!["admission", "news", "observe", "discharged", "discharge"]
        );
    }

    #[test]
    fn test_watched_message_must_name_a_step() {
        let dir = tempfile::tempdir().unwrap();
        let path = data_file(&dir);
        assert!(admission_plan(&path, &["news".to_string()]).is_ok());
        assert!(admission_plan(&path, &["labs".to_string()]).is_err());
    }
}
