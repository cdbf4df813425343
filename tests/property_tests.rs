//! Property-based tests for dhtnat
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

fn any_socket_addr() -> impl Strategy<Value = SocketAddr> {
    prop_oneof![
        (any::<[u8; 4]>(), any::<u16>())
            .prop_map(|(ip, port)| SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port)),
        (any::<[u8; 16]>(), any::<u16>())
            .prop_map(|(ip, port)| SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port)),
    ]
}

// ============================================================================
// Wire Properties
// ============================================================================

mod wire_properties {
    use super::*;
    use dhtnat::WireMessage;
    use dhtnat::wire::{decode_addr, encode_addr};

    proptest! {
        /// Encoded addresses decode to the same address
        #[test]
        fn addr_codec_recovers_address(addr in any_socket_addr()) {
            let encoded = encode_addr(addr);
            prop_assert_eq!(encoded.len(), if addr.is_ipv4() { 6 } else { 18 });
            prop_assert_eq!(decode_addr(&encoded).unwrap(), addr);
        }

        /// Only the two compact lengths are accepted
        #[test]
        fn addr_codec_rejects_other_lengths(bytes in prop::collection::vec(any::<u8>(), 0..32)) {
            prop_assume!(bytes.len() != 6 && bytes.len() != 18);
            prop_assert!(decode_addr(&bytes).is_err());
        }

        /// Arbitrary bytes never panic the dictionary decoder
        #[test]
        fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = WireMessage::from_bytes(&bytes);
        }

        /// A punch request keeps its fields through the wire form
        #[test]
        fn punch_request_survives_wire(
            nonce in any::<u64>(),
            reason in "[a-z]{0,16}",
            target in any_socket_addr(),
        ) {
            let msg = WireMessage::PunchReq {
                nonce,
                reason: reason.clone(),
                target_addr: encode_addr(target),
                ts_ms: 0,
                client_data: None,
            };
            let decoded = WireMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
            prop_assert_eq!(decoded.nonce(), nonce);
            prop_assert_eq!(decoded.message_type(), "punch_req");
            match decoded {
                WireMessage::PunchReq { reason: r, target_addr, .. } => {
                    prop_assert_eq!(r, reason);
                    prop_assert_eq!(decode_addr(&target_addr).unwrap(), target);
                }
                other => prop_assert!(false, "unexpected message {:?}", other),
            }
        }
    }
}

// ============================================================================
// Ranking Properties
// ============================================================================

mod ranking_properties {
    use super::*;
    use dhtnat::{Contact, IdentityOracle, LatencyOracle, ProximityOracle};
    use std::collections::HashSet;
    use std::time::Duration;

    fn candidates(count: usize) -> Vec<Contact> {
        (0..count)
            .map(|i| {
                Contact::from_addr(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::new(10, 9, (i / 250) as u8, (i % 250) as u8 + 1)),
                    7400,
                ))
            })
            .collect()
    }

    proptest! {
        /// The identity oracle is a no-op
        #[test]
        fn identity_rank_is_stable(count in 0usize..40) {
            let input = candidates(count);
            prop_assert_eq!(IdentityOracle.rank(input.clone()), input);
        }

        /// Latency ranking is a permutation sorted by measured latency
        #[test]
        fn latency_rank_is_sorted_permutation(
            latencies in prop::collection::vec(prop::option::of(0u64..500), 0..40),
        ) {
            let input = candidates(latencies.len());
            let oracle = LatencyOracle::new();
            for (contact, latency) in input.iter().zip(&latencies) {
                if let Some(ms) = latency {
                    oracle.update_latency(contact.addr(), Duration::from_millis(*ms));
                }
            }

            let ranked = oracle.rank(input.clone());
            prop_assert_eq!(ranked.len(), input.len());
            let unique: HashSet<_> = ranked.iter().map(Contact::addr).collect();
            prop_assert_eq!(unique.len(), input.len());

            let keys: Vec<_> = ranked
                .iter()
                .map(|c| oracle.get_latency(&c.addr()).map_or((1, Duration::ZERO), |l| (0, l)))
                .collect();
            prop_assert!(keys.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}

// ============================================================================
// Contact Properties
// ============================================================================

mod contact_properties {
    use super::*;
    use dhtnat::{Contact, NodeId};

    proptest! {
        /// Hex form parses back to the same identifier
        #[test]
        fn node_id_hex_parses_back(bytes in any::<[u8; 32]>()) {
            let id = NodeId::from_bytes(bytes);
            prop_assert_eq!(id.to_hex().parse::<NodeId>().unwrap(), id);
        }

        /// `id@addr` parses to that identity and address
        #[test]
        fn contact_parses_with_id(bytes in any::<[u8; 32]>(), addr in any_socket_addr()) {
            let id = NodeId::from_bytes(bytes);
            let contact: Contact = format!("{}@{addr}", id.to_hex()).parse().unwrap();
            prop_assert_eq!(*contact.id(), id);
            prop_assert_eq!(contact.addr(), addr);
        }

        /// A bare address always derives the same identity
        #[test]
        fn bare_address_identity_is_deterministic(addr in any_socket_addr()) {
            let a: Contact = addr.to_string().parse().unwrap();
            prop_assert_eq!(*a.id(), NodeId::from_addr(addr));
            prop_assert_eq!(a.addr(), addr);
            prop_assert_eq!(a, Contact::from_addr(addr));
        }
    }
}
