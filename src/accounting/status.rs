use crate::error::{AppError, AppResult};

/// key: recurring-status -> template state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecurringStatus {
    Active,
    Paused,
    Ended,
    Canceled,
}

impl RecurringStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecurringStatus::Active => "active",
            RecurringStatus::Paused => "paused",
            RecurringStatus::Ended => "ended",
            RecurringStatus::Canceled => "canceled",
        }
    }

    pub fn parse(raw: &str) -> AppResult<RecurringStatus> {
        Ok(match raw {
            "active" => RecurringStatus::Active,
            "paused" => RecurringStatus::Paused,
            "ended" => RecurringStatus::Ended,
            "canceled" => RecurringStatus::Canceled,
            other => {
                return Err(AppError::validation(
                    "recurring_expense.invalid_status",
                    format!("unknown status: {other}"),
                ))
            }
        })
    }

    pub fn can_transition(self, to: RecurringStatus) -> bool {
        use RecurringStatus::*;
        matches!(
            (self, to),
            (Active, Paused)
                | (Active, Ended)
                | (Active, Canceled)
                | (Paused, Active)
                | (Paused, Ended)
                | (Paused, Canceled)
                | (Ended, Active)
                | (Ended, Canceled)
                | (Canceled, Active)
        )
    }

    pub fn ensure_transition(self, to: RecurringStatus) -> AppResult<()> {
        if self == to || !self.can_transition(to) {
            return Err(AppError::invalid_transition(
                "recurring_expense.invalid_transition",
                format!("cannot move from {} to {}", self.as_str(), to.as_str()),
            ));
        }
        Ok(())
    }
}
