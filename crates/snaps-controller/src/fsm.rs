//! Lifecycle state machine of a snap.
//!
//! The machine is a static transition table keyed by `(state, event)`.
//! Guards and actions are referenced by name in the table and bound to
//! implementations when a [`Machine`] is built, so a table entry without an
//! implementation is caught at construction rather than on first use.
//!
//! Implementations receive a caller-supplied context (`C`) instead of
//! capturing shared state. The controller passes its snap store, which keeps
//! the interpreter free of locks.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use snaps_execution::SnapId;
use strum::Display;
use thiserror::Error;

/// Running status of a snap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum SnapStatus {
    /// First start after a fresh install has not happened yet.
    Installing,
    /// Being replaced by a newer version.
    Updating,
    /// Executing in a sandbox.
    Running,
    /// Not executing.
    Stopped,
    /// Terminated after an unhandled error.
    Crashed,
}

/// Inputs to the lifecycle machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "camelCase")]
pub enum StatusEvent {
    /// The snap was started.
    Start,
    /// The snap was stopped.
    Stop,
    /// The snap failed.
    Crash,
    /// An update began.
    Update,
}

/// Named guard condition referenced by the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Guard {
    /// The snap record is enabled.
    Enabled,
}

/// Named side effect referenced by the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Action {
    /// Writes the new status into the snap record.
    PersistStatus,
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    from: SnapStatus,
    event: StatusEvent,
    to: SnapStatus,
    guard: Option<Guard>,
    actions: &'static [Action],
}

const PERSIST: &[Action] = &[Action::PersistStatus];

const TRANSITIONS: &[Transition] = &[
    Transition {
        from: SnapStatus::Installing,
        event: StatusEvent::Start,
        to: SnapStatus::Running,
        guard: Some(Guard::Enabled),
        actions: PERSIST,
    },
    Transition {
        from: SnapStatus::Updating,
        event: StatusEvent::Start,
        to: SnapStatus::Running,
        guard: Some(Guard::Enabled),
        actions: PERSIST,
    },
    Transition {
        from: SnapStatus::Updating,
        event: StatusEvent::Stop,
        to: SnapStatus::Stopped,
        guard: None,
        actions: PERSIST,
    },
    Transition {
        from: SnapStatus::Running,
        event: StatusEvent::Stop,
        to: SnapStatus::Stopped,
        guard: None,
        actions: PERSIST,
    },
    Transition {
        from: SnapStatus::Running,
        event: StatusEvent::Crash,
        to: SnapStatus::Crashed,
        guard: None,
        actions: PERSIST,
    },
    Transition {
        from: SnapStatus::Stopped,
        event: StatusEvent::Start,
        to: SnapStatus::Running,
        guard: Some(Guard::Enabled),
        actions: PERSIST,
    },
    Transition {
        from: SnapStatus::Stopped,
        event: StatusEvent::Update,
        to: SnapStatus::Updating,
        guard: None,
        actions: PERSIST,
    },
    Transition {
        from: SnapStatus::Crashed,
        event: StatusEvent::Start,
        to: SnapStatus::Running,
        guard: Some(Guard::Enabled),
        actions: PERSIST,
    },
    Transition {
        from: SnapStatus::Crashed,
        event: StatusEvent::Update,
        to: SnapStatus::Updating,
        guard: None,
        actions: PERSIST,
    },
];

/// Errors raised by machine construction and interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsmError {
    /// A guard used by the table has no implementation.
    #[error("guard '{guard}' is referenced but not implemented")]
    MissingGuard {
        /// The unimplemented guard.
        guard: Guard,
    },
    /// An action used by the table has no implementation.
    #[error("action '{action}' is referenced but not implemented")]
    MissingAction {
        /// The unimplemented action.
        action: Action,
    },
    /// The interpreter was stopped.
    #[error("interpreter has been stopped")]
    InterpreterStopped,
    /// The interpreter was used before being started.
    #[error("interpreter has not been started")]
    NotStarted,
}

/// Guard implementation: decides whether a transition may fire.
pub type GuardFn<C> = fn(&C, &SnapId) -> bool;

/// Action implementation: runs after a transition fired.
pub type ActionFn<C> = fn(&mut C, &SnapId, SnapStatus);

/// The lifecycle table bound to guard and action implementations.
#[derive(Debug)]
pub struct Machine<C> {
    guards: HashMap<Guard, GuardFn<C>>,
    actions: HashMap<Action, ActionFn<C>>,
}

impl<C> Machine<C> {
    /// Binds the table to `guards` and `actions`.
    ///
    /// # Errors
    ///
    /// Returns [`FsmError::MissingGuard`] or [`FsmError::MissingAction`] when
    /// the table references something not supplied.
    pub fn new(
        guards: impl IntoIterator<Item = (Guard, GuardFn<C>)>,
        actions: impl IntoIterator<Item = (Action, ActionFn<C>)>,
    ) -> Result<Self, FsmError> {
        let machine = Self {
            guards: guards.into_iter().collect(),
            actions: actions.into_iter().collect(),
        };
        for transition in TRANSITIONS {
            if let Some(guard) = transition.guard
                && !machine.guards.contains_key(&guard)
            {
                return Err(FsmError::MissingGuard { guard });
            }
            if let Some(action) = transition
                .actions
                .iter()
                .find(|action| !machine.actions.contains_key(action))
            {
                return Err(FsmError::MissingAction { action: *action });
            }
        }
        Ok(machine)
    }

    fn transition(&self, from: SnapStatus, event: StatusEvent) -> Option<&'static Transition> {
        TRANSITIONS
            .iter()
            .find(|transition| transition.from == from && transition.event == event)
    }
}

/// Result of sending an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The state changed.
    Changed {
        /// State before the event.
        from: SnapStatus,
        /// State after the event.
        to: SnapStatus,
    },
    /// No transition matched, or its guard failed.
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Started,
    Stopped,
}

/// Live machine instance for one snap.
#[derive(Debug)]
pub struct Interpreter<C> {
    machine: Arc<Machine<C>>,
    snap_id: SnapId,
    state: SnapStatus,
    phase: Phase,
}

impl<C> Interpreter<C> {
    /// Creates an interpreter positioned at `initial`. It must be started
    /// before events are sent.
    #[must_use]
    pub fn new(machine: Arc<Machine<C>>, snap_id: SnapId, initial: SnapStatus) -> Self {
        Self {
            machine,
            snap_id,
            state: initial,
            phase: Phase::Created,
        }
    }

    /// Starts the interpreter. Starting emits no transition.
    ///
    /// # Errors
    ///
    /// Returns [`FsmError::InterpreterStopped`] after [`Interpreter::stop`].
    pub fn start(&mut self) -> Result<(), FsmError> {
        if self.phase == Phase::Stopped {
            return Err(FsmError::InterpreterStopped);
        }
        self.phase = Phase::Started;
        Ok(())
    }

    /// Stops the interpreter permanently.
    pub fn stop(&mut self) {
        self.phase = Phase::Stopped;
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SnapStatus {
        self.state
    }

    /// Feeds `event` to the machine.
    ///
    /// # Errors
    ///
    /// Returns [`FsmError::NotStarted`] or [`FsmError::InterpreterStopped`]
    /// when the interpreter cannot accept events.
    pub fn send(&mut self, context: &mut C, event: StatusEvent) -> Result<TransitionOutcome, FsmError> {
        match self.phase {
            Phase::Created => return Err(FsmError::NotStarted),
            Phase::Stopped => return Err(FsmError::InterpreterStopped),
            Phase::Started => {}
        }

        let Some(transition) = self.machine.transition(self.state, event) else {
            return Ok(TransitionOutcome::Unchanged);
        };
        if let Some(guard) = transition.guard {
            let check = self
                .machine
                .guards
                .get(&guard)
                .ok_or(FsmError::MissingGuard { guard })?;
            if !check(context, &self.snap_id) {
                return Ok(TransitionOutcome::Unchanged);
            }
        }

        let from = self.state;
        self.state = transition.to;
        for action in transition.actions {
            let run = self
                .machine
                .actions
                .get(action)
                .ok_or(FsmError::MissingAction { action: *action })?;
            run(context, &self.snap_id, transition.to);
        }

        if from == transition.to {
            return Ok(TransitionOutcome::Unchanged);
        }
        Ok(TransitionOutcome::Changed {
            from,
            to: transition.to,
        })
    }

    /// Moves to `state` without consulting the table. Used when a rollback
    /// restores a snap to a known-stopped state.
    pub fn force(&mut self, context: &mut C, state: SnapStatus) {
        self.state = state;
        if let Some(run) = self.machine.actions.get(&Action::PersistStatus) {
            run(context, &self.snap_id, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;

    #[derive(Debug, Default)]
    struct Record {
        disabled: bool,
        persisted: Vec<SnapStatus>,
    }

    fn is_enabled(record: &Record, _snap_id: &SnapId) -> bool {
        !record.disabled
    }

    fn persist(record: &mut Record, _snap_id: &SnapId, status: SnapStatus) {
        record.persisted.push(status);
    }

    #[fixture]
    fn machine() -> Arc<Machine<Record>> {
        Arc::new(
            Machine::new(
                [(Guard::Enabled, is_enabled as GuardFn<Record>)],
                [(Action::PersistStatus, persist as ActionFn<Record>)],
            )
            .expect("complete machine"),
        )
    }

    fn started(machine: &Arc<Machine<Record>>, initial: SnapStatus) -> Interpreter<Record> {
        let mut interpreter = Interpreter::new(Arc::clone(machine), SnapId::from("npm:fsm"), initial);
        interpreter.start().expect("start");
        interpreter
    }

    #[rstest]
    #[case(SnapStatus::Installing, StatusEvent::Start, SnapStatus::Running)]
    #[case(SnapStatus::Updating, StatusEvent::Start, SnapStatus::Running)]
    #[case(SnapStatus::Updating, StatusEvent::Stop, SnapStatus::Stopped)]
    #[case(SnapStatus::Running, StatusEvent::Stop, SnapStatus::Stopped)]
    #[case(SnapStatus::Running, StatusEvent::Crash, SnapStatus::Crashed)]
    #[case(SnapStatus::Stopped, StatusEvent::Start, SnapStatus::Running)]
    #[case(SnapStatus::Stopped, StatusEvent::Update, SnapStatus::Updating)]
    #[case(SnapStatus::Crashed, StatusEvent::Start, SnapStatus::Running)]
    #[case(SnapStatus::Crashed, StatusEvent::Update, SnapStatus::Updating)]
    fn follows_the_transition_table(
        machine: Arc<Machine<Record>>,
        #[case] from: SnapStatus,
        #[case] event: StatusEvent,
        #[case] to: SnapStatus,
    ) {
        let mut record = Record::default();
        let mut interpreter = started(&machine, from);

        let outcome = interpreter.send(&mut record, event).expect("send");

        assert_eq!(outcome, TransitionOutcome::Changed { from, to });
        assert_eq!(interpreter.state(), to);
        assert_eq!(record.persisted, vec![to]);
    }

    #[rstest]
    #[case(SnapStatus::Installing, StatusEvent::Stop)]
    #[case(SnapStatus::Installing, StatusEvent::Update)]
    #[case(SnapStatus::Running, StatusEvent::Start)]
    #[case(SnapStatus::Running, StatusEvent::Update)]
    #[case(SnapStatus::Stopped, StatusEvent::Crash)]
    #[case(SnapStatus::Crashed, StatusEvent::Stop)]
    fn illegal_events_leave_state_unchanged(
        machine: Arc<Machine<Record>>,
        #[case] from: SnapStatus,
        #[case] event: StatusEvent,
    ) {
        let mut record = Record::default();
        let mut interpreter = started(&machine, from);

        let outcome = interpreter.send(&mut record, event).expect("send");

        assert_eq!(outcome, TransitionOutcome::Unchanged);
        assert_eq!(interpreter.state(), from);
        assert!(record.persisted.is_empty());
    }

    #[rstest]
    fn start_requires_an_enabled_snap(machine: Arc<Machine<Record>>) {
        let mut record = Record {
            disabled: true,
            ..Record::default()
        };
        let mut interpreter = started(&machine, SnapStatus::Stopped);

        let outcome = interpreter.send(&mut record, StatusEvent::Start).expect("send");

        assert_eq!(outcome, TransitionOutcome::Unchanged);
        assert_eq!(interpreter.state(), SnapStatus::Stopped);
    }

    #[rstest]
    fn full_cycle_persists_every_status(machine: Arc<Machine<Record>>) {
        let mut record = Record::default();
        let mut interpreter = started(&machine, SnapStatus::Installing);

        for event in [
            StatusEvent::Start,
            StatusEvent::Crash,
            StatusEvent::Update,
            StatusEvent::Start,
            StatusEvent::Stop,
        ] {
            interpreter.send(&mut record, event).expect("send");
        }

        assert_eq!(
            record.persisted,
            vec![
                SnapStatus::Running,
                SnapStatus::Crashed,
                SnapStatus::Updating,
                SnapStatus::Running,
                SnapStatus::Stopped,
            ]
        );
    }

    #[rstest]
    fn rejects_events_outside_the_started_phase(machine: Arc<Machine<Record>>) {
        let mut record = Record::default();
        let mut interpreter =
            Interpreter::new(Arc::clone(&machine), SnapId::from("npm:fsm"), SnapStatus::Stopped);

        assert_eq!(
            interpreter.send(&mut record, StatusEvent::Start),
            Err(FsmError::NotStarted)
        );

        interpreter.start().expect("start");
        interpreter.stop();
        assert_eq!(
            interpreter.send(&mut record, StatusEvent::Start),
            Err(FsmError::InterpreterStopped)
        );
        assert_eq!(interpreter.start(), Err(FsmError::InterpreterStopped));
    }

    #[rstest]
    fn construction_requires_every_guard() {
        let guards: Vec<(Guard, GuardFn<Record>)> = Vec::new();
        let result = Machine::new(guards, [(Action::PersistStatus, persist as ActionFn<Record>)]);
        assert_eq!(
            result.map(drop),
            Err(FsmError::MissingGuard {
                guard: Guard::Enabled
            })
        );
    }

    #[rstest]
    fn construction_requires_every_action() {
        let actions: Vec<(Action, ActionFn<Record>)> = Vec::new();
        let result = Machine::new([(Guard::Enabled, is_enabled as GuardFn<Record>)], actions);
        assert_eq!(
            result.map(drop),
            Err(FsmError::MissingAction {
                action: Action::PersistStatus
            })
        );
    }
}
