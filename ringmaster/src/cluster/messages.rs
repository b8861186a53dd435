//! Datagrams of both protocols.
//!
//! Every datagram starts with a `kind` tag and the sender's ID, both `u32`. Election datagrams
//! add a `uuid` used to suppress duplicates. The body follows, its layout fixed by the kind.

use crate as ringmaster;
use crate::core::{decode_exact, encode_to_vec, DecodeError, Member, Wire};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Tag of a membership datagram.
#[derive(IntoPrimitive, TryFromPrimitive, Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum MembershipKind {
  /// A [`JoinRequest`].
  JoinRequest = 0,
  /// A [`Heartbeat`].
  Heartbeat = 1,
}

/// Tag of an election datagram.
#[derive(IntoPrimitive, TryFromPrimitive, Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum ElectionKind {
  /// An [`Introduction`].
  Introduction = 0,
  /// A [`Ballot`].
  Election = 1,
  /// An [`Elected`].
  Elected = 2,
  /// A [`Proposal`].
  Proposal = 3,
}

/// Leads every membership datagram.
#[derive(ringmaster::Wire, Clone, Copy, PartialEq, Eq, Debug)]
pub struct MembershipHeader {
  /// A [`MembershipKind`].
  pub kind: u32,
  /// ID of the sending node.
  pub sender: u32,
}

/// Leads every election datagram.
#[derive(ringmaster::Wire, Clone, Copy, PartialEq, Eq, Debug)]
pub struct ElectionHeader {
  /// An [`ElectionKind`].
  pub kind: u32,
  /// ID of the sending node.
  pub sender: u32,
  /// Random per message. Retransmissions share it.
  pub uuid: u32,
}

/// Sent to a seed by a node that wants to join.
#[derive(ringmaster::Wire, Clone, PartialEq, Eq, Debug)]
pub struct JoinRequest {
  /// The joining node, with the ID it picked.
  pub candidate: Member,
}

/// The gossip delta exchanged between neighbors every round.
#[derive(ringmaster::Wire, Clone, Default, PartialEq, Eq, Debug)]
pub struct Heartbeat {
  /// Members failed by the sender or by gossip it relays.
  pub failed: Vec<u32>,
  /// Members that announced their departure.
  pub left: Vec<u32>,
  /// Newly admitted members. An introduction carries the whole membership here.
  pub joined: Vec<Member>,
}

/// Sent by the master to a node that joined after it was elected.
#[derive(ringmaster::Wire, Clone, Copy, PartialEq, Eq, Debug)]
pub struct Introduction {
  /// The master's ID.
  pub master_id: u32,
}

/// The ELECTION message: the initiator's ID and the best candidate seen so far.
#[derive(ringmaster::Wire, Clone, Copy, PartialEq, Eq, Debug)]
pub struct Ballot {
  /// The node that started this election.
  pub initiator_id: u32,
  /// The highest ID met so far on the ring.
  pub vote_id: u32,
}

/// Announces the winner around the ring.
#[derive(ringmaster::Wire, Clone, Copy, PartialEq, Eq, Debug)]
pub struct Elected {
  /// The master's ID.
  pub master_id: u32,
}

/// Restarts a stalled election. Has no body.
#[derive(ringmaster::Wire, Clone, Copy, PartialEq, Eq, Debug)]
pub struct Proposal;

/// A decoded membership datagram.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum MembershipMsg {
  /// A node asks to be admitted.
  JoinRequest(JoinRequest),
  /// Liveness plus the membership delta.
  Heartbeat(Heartbeat),
}
impl MembershipMsg {
  /// The header tag for this message.
  pub fn kind(&self) -> MembershipKind {
    match self {
      MembershipMsg::JoinRequest(_) => MembershipKind::JoinRequest,
      MembershipMsg::Heartbeat(_) => MembershipKind::Heartbeat,
    }
  }

  /// Header and body, ready to send.
  pub fn encode(&self, sender: u32) -> Vec<u8> {
    let mut buf = encode_to_vec(&MembershipHeader {
      kind: self.kind().into(),
      sender: sender,
    });
    match self {
      MembershipMsg::JoinRequest(m) => m.encode(&mut buf),
      MembershipMsg::Heartbeat(m) => m.encode(&mut buf),
    }
    buf
  }

  /// Returns the sender ID along with the message.
  pub fn decode(bytes: &[u8]) -> Result<(u32, MembershipMsg), DecodeError> {
    let mut buf = bytes;
    let header = MembershipHeader::decode(&mut buf)?;
    let kind = MembershipKind::try_from(header.kind)
      .map_err(|_| DecodeError::UnknownKind(header.kind))?;
    let msg = match kind {
      MembershipKind::JoinRequest => {
        let req: JoinRequest = decode_exact(buf)?;
        check_member(&req.candidate)?;
        MembershipMsg::JoinRequest(req)
      }
      MembershipKind::Heartbeat => {
        let hb: Heartbeat = decode_exact(buf)?;
        hb.joined.iter().try_for_each(check_member)?;
        MembershipMsg::Heartbeat(hb)
      }
    };
    Ok((header.sender, msg))
  }
}

/// A decoded election datagram.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ElectionMsg {
  /// Tells a newcomer who the master is.
  Introduction(Introduction),
  /// An election lap in progress.
  Election(Ballot),
  /// The election is decided.
  Elected(Elected),
  /// Start over.
  Proposal,
}
impl ElectionMsg {
  /// The header tag for this message.
  pub fn kind(&self) -> ElectionKind {
    match self {
      ElectionMsg::Introduction(_) => ElectionKind::Introduction,
      ElectionMsg::Election(_) => ElectionKind::Election,
      ElectionMsg::Elected(_) => ElectionKind::Elected,
      ElectionMsg::Proposal => ElectionKind::Proposal,
    }
  }

  /// Header and body, ready to send.
  pub fn encode(&self, sender: u32, uuid: u32) -> Vec<u8> {
    let mut buf = encode_to_vec(&ElectionHeader {
      kind: self.kind().into(),
      sender: sender,
      uuid: uuid,
    });
    match self {
      ElectionMsg::Introduction(m) => m.encode(&mut buf),
      ElectionMsg::Election(m) => m.encode(&mut buf),
      ElectionMsg::Elected(m) => m.encode(&mut buf),
      ElectionMsg::Proposal => Proposal.encode(&mut buf),
    }
    buf
  }

  /// Returns the header along with the message.
  pub fn decode(bytes: &[u8]) -> Result<(ElectionHeader, ElectionMsg), DecodeError> {
    let mut buf = bytes;
    let header = ElectionHeader::decode(&mut buf)?;
    let kind =
      ElectionKind::try_from(header.kind).map_err(|_| DecodeError::UnknownKind(header.kind))?;
    let msg = match kind {
      ElectionKind::Introduction => ElectionMsg::Introduction(decode_exact(buf)?),
      ElectionKind::Election => ElectionMsg::Election(decode_exact(buf)?),
      ElectionKind::Elected => ElectionMsg::Elected(decode_exact(buf)?),
      ElectionKind::Proposal => {
        decode_exact::<Proposal>(buf)?;
        ElectionMsg::Proposal
      }
    };
    Ok((header, msg))
  }
}

fn check_member(member: &Member) -> Result<(), DecodeError> {
  if member.is_empty() || member.hostname.is_empty() {
    return Err(DecodeError::EmptyMember);
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_heartbeat_layout() {
    let msg = MembershipMsg::Heartbeat(Heartbeat {
      failed: vec![3],
      left: vec![],
      joined: vec![Member::new(9, "h9".to_string())],
    });
    let bytes = msg.encode(0x0102);
    assert_eq!(
      bytes,
      vec![
        1, 0, 0, 0, // kind
        2, 1, 0, 0, // sender
        1, 0, 0, 0, 3, 0, 0, 0, // failed
        0, 0, 0, 0, // left
        1, 0, 0, 0, 9, 0, 0, 0, 2, 0, 0, 0, b'h', b'9', // joined
      ]
    );
    assert_eq!(MembershipMsg::decode(&bytes), Ok((0x0102, msg)));
  }

  #[test]
  fn test_election_layout() {
    let msg = ElectionMsg::Election(Ballot {
      initiator_id: 5,
      vote_id: 7,
    });
    let bytes = msg.encode(5, 77);
    assert_eq!(&bytes[..12], &[1, 0, 0, 0, 5, 0, 0, 0, 77, 0, 0, 0]);
    assert_eq!(bytes.len(), 20);
    let (header, decoded) = ElectionMsg::decode(&bytes).unwrap();
    assert_eq!((header.sender, header.uuid), (5, 77));
    assert_eq!(decoded, msg);

    let proposal = ElectionMsg::Proposal.encode(1, 2);
    assert_eq!(proposal.len(), 12);
    assert_eq!(ElectionMsg::decode(&proposal).unwrap().1, ElectionMsg::Proposal);
  }

  #[test]
  fn test_malformed_datagrams() {
    let join = MembershipMsg::JoinRequest(JoinRequest {
      candidate: Member::new(0, "h0".to_string()),
    });
    assert_eq!(MembershipMsg::decode(&join.encode(1)), Err(DecodeError::EmptyMember));
    let join = MembershipMsg::JoinRequest(JoinRequest {
      candidate: Member::new(4, String::new()),
    });
    assert_eq!(MembershipMsg::decode(&join.encode(1)), Err(DecodeError::EmptyMember));

    let mut bytes = ElectionMsg::Elected(Elected { master_id: 3 }).encode(1, 1);
    bytes.push(0);
    assert_eq!(ElectionMsg::decode(&bytes), Err(DecodeError::TrailingBytes(1)));
    bytes[0] = 9;
    assert_eq!(ElectionMsg::decode(&bytes), Err(DecodeError::UnknownKind(9)));
    assert!(matches!(
      MembershipMsg::decode(&[1, 0, 0]),
      Err(DecodeError::Truncated { .. })
    ));
  }
}
