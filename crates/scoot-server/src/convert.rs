use tonic::Status;

use scoot_types::Round;

/// Parse the wire `[ballot, proposer]` pair, rejecting malformed rounds
/// before they reach the acceptor.
pub fn wire_round(raw: &[i64]) -> Result<Round, Status> {
    Round::from_wire(raw)
        .ok_or_else(|| Status::invalid_argument("round must be a [ballot, proposer] pair"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_exactly_two_elements() {
        assert_eq!(wire_round(&[3, 1]).unwrap(), Round::new(3, 1));
        assert!(wire_round(&[]).is_err());
        assert!(wire_round(&[1]).is_err());
        assert!(wire_round(&[1, 2, 3]).is_err());
    }
}
