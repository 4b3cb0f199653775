/// Canonical order status, independent of any venue's vocabulary (matches the
/// CHECK constraint on `orders.status`).
///
/// Lifecycle of an order once it has been handed to a venue:
/// - `Pending`: accepted locally or by the venue but not yet working
/// - `New`: acknowledged and resting on the venue's book
/// - `Partial`: some quantity executed, remainder still working
/// - `Filled`, `Cancelled`, `Rejected`, `Expired`: terminal, never re-queried
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OrderStatus {
    Pending,
    New,
    Partial,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Statuses that still need to be reconciled against the venue.
    pub const RECONCILABLE: [Self; 3] = [Self::Pending, Self::New, Self::Partial];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::New => "new",
            Self::Partial => "partial",
            Self::Filled => "filled",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    pub const fn is_terminal(self) -> bool {
        match self {
            Self::Pending | Self::New | Self::Partial => false,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired => true,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseOrderStatusError {
    #[error(
        "Invalid order status: '{0}'. Expected one of: pending, new, partial, filled, cancelled, rejected, expired"
    )]
    InvalidStatus(String),
}

impl std::str::FromStr for OrderStatus {
    type Err = ParseOrderStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "new" => Ok(Self::New),
            "partial" => Ok(Self::Partial),
            "filled" => Ok(Self::Filled),
            "cancelled" => Ok(Self::Cancelled),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            _ => Err(ParseOrderStatusError::InvalidStatus(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::New,
            OrderStatus::Partial,
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::Rejected,
            OrderStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_parse_rejects_venue_vocabulary() {
        assert!("FILLED".parse::<OrderStatus>().is_err());
        assert!("canceled".parse::<OrderStatus>().is_err());
        assert!("".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::Partial.is_terminal());
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
    }

    #[test]
    fn test_reconcilable_statuses_are_not_terminal() {
        assert!(
            OrderStatus::RECONCILABLE
                .iter()
                .all(|status| !status.is_terminal())
        );
    }
}
