use std::str::from_utf8;

use anyhow::Context;
use bytes::Bytes;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};

/// 快速解析结果，尽可能零拷贝 / quick-parse result, zero-copy where possible
pub struct QuickQuery<'a> {
    pub tx_id: u16,
    pub qd_count: u16,
    /// First question name, lowercased, no trailing dot.
    pub qname: &'a str,
    pub qtype: u16,
}

/// Parse only the DNS header and the first question, for cache lookups and
/// classification without the allocation cost of a full `Message` decode.
/// `buf` receives the normalized (lowercased) name; 256 bytes is enough for
/// any legal domain name. Returns `None` on malformed input or QDCOUNT == 0.
pub fn parse_quick<'a>(packet: &[u8], buf: &'a mut [u8]) -> Option<QuickQuery<'a>> {
    if packet.len() < 12 {
        return None;
    }

    let tx_id = u16::from_be_bytes([packet[0], packet[1]]);
    let qd_count = u16::from_be_bytes([packet[4], packet[5]]);
    if qd_count == 0 {
        return None;
    }

    let mut pos = 12;
    let mut buf_pos = 0;

    let mut jumped = false;
    let mut max_jumps = 5;
    let mut current_pos = pos;
    let packet_len = packet.len();

    loop {
        if current_pos >= packet_len {
            return None;
        }
        let len = packet[current_pos];

        if len == 0 {
            if !jumped {
                pos = current_pos + 1;
            }
            break;
        }

        if (len & 0xC0) == 0xC0 {
            // compression pointer
            if packet_len < current_pos + 2 {
                return None;
            }
            if !jumped {
                pos = current_pos + 2;
                jumped = true;
            }
            let offset = (((len as u16) & 0x3F) << 8) | (packet[current_pos + 1] as u16);
            current_pos = offset as usize;
            max_jumps -= 1;
            if max_jumps == 0 {
                return None; // loop detection
            }
            continue;
        }

        let label_len = len as usize;
        current_pos += 1;
        if packet_len < current_pos + label_len {
            return None;
        }

        if buf_pos > 0 {
            if buf_pos >= buf.len() {
                return None;
            }
            buf[buf_pos] = b'.';
            buf_pos += 1;
        }

        // DNS labels are ASCII (or punycode); lowercasing per byte leaves any
        // raw non-ASCII byte unchanged.
        for &b in &packet[current_pos..current_pos + label_len] {
            if buf_pos >= buf.len() {
                return None;
            }
            buf[buf_pos] = b.to_ascii_lowercase();
            buf_pos += 1;
        }

        current_pos += label_len;
    }

    if packet.len() < pos + 4 {
        return None;
    }
    let qtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);

    let qname = from_utf8(&buf[..buf_pos]).ok()?;

    Some(QuickQuery {
        tx_id,
        qd_count,
        qname,
        qtype,
    })
}

/// TTL that drives caching: the first Answer RR's TTL, verbatim, or 0 when
/// the response carries no answers (uncacheable). Authority/Additional TTLs
/// are ignored. Wire scan, no full decode.
pub fn first_answer_ttl(packet: &[u8]) -> u64 {
    if packet.len() < 12 {
        return 0;
    }

    let qd_count = u16::from_be_bytes([packet[4], packet[5]]);
    let an_count = u16::from_be_bytes([packet[6], packet[7]]);
    if an_count == 0 {
        return 0;
    }

    let mut pos = 12;
    let packet_len = packet.len();

    // skip questions
    for _ in 0..qd_count {
        loop {
            if pos >= packet_len {
                return 0;
            }
            let len = packet[pos];
            if len == 0 {
                pos += 1;
                break;
            }
            if (len & 0xC0) == 0xC0 {
                pos += 2;
                break;
            }
            pos += 1 + (len as usize);
        }
        pos += 4; // type + class
    }

    // first answer: skip the owner name, then TYPE(2) CLASS(2) TTL(4)
    loop {
        if pos >= packet_len {
            return 0;
        }
        let len = packet[pos];
        if len == 0 {
            pos += 1;
            break;
        }
        if (len & 0xC0) == 0xC0 {
            pos += 2;
            break;
        }
        pos += 1 + (len as usize);
    }

    if pos + 8 > packet_len {
        return 0;
    }
    u32::from_be_bytes([packet[pos + 4], packet[pos + 5], packet[pos + 6], packet[pos + 7]]) as u64
}

/// Prepare cached/upstream response bytes for the client: restore the
/// request's transaction ID and overwrite every Answer/Authority/Additional
/// TTL with the remaining cache TTL, so clients never see an inflated TTL.
pub fn seal_response(response: &[u8], request_id: u16, remaining_ttl: u64) -> anyhow::Result<Bytes> {
    let mut msg = Message::from_bytes(response).context("unpack upstream response")?;
    msg.set_id(request_id);

    let ttl = remaining_ttl.min(u32::MAX as u64) as u32;
    for record in msg.answers_mut() {
        record.set_ttl(ttl);
    }
    for record in msg.name_servers_mut() {
        record.set_ttl(ttl);
    }
    for record in msg.additionals_mut() {
        record.set_ttl(ttl);
    }

    let out = msg.to_bytes().context("repack response")?;
    Ok(Bytes::from(out))
}

/// Patch the transaction ID in place, without a decode round-trip. Used for
/// the multi-question passthrough where TTLs are left untouched.
pub fn patch_id(response: &mut [u8], request_id: u16) {
    if response.len() >= 2 {
        response[0..2].copy_from_slice(&request_id.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query};
    use hickory_proto::rr::rdata::{A, NS};
    use hickory_proto::rr::{Name, RData, Record, RecordType};

    fn query_packet(name: &str, qtype: RecordType, id: u16) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.add_query(Query::query(Name::from_ascii(name).unwrap(), qtype));
        msg.to_bytes().unwrap()
    }

    fn response_packet(name: &str, ttl: u32, with_extras: bool) -> Vec<u8> {
        let owner = Name::from_ascii(name).unwrap();
        let mut msg = Message::new();
        msg.set_id(0x1234);
        msg.set_message_type(MessageType::Response);
        msg.add_query(Query::query(owner.clone(), RecordType::A));
        msg.add_answer(Record::from_rdata(
            owner.clone(),
            ttl,
            RData::A(A::new(93, 184, 216, 34)),
        ));
        if with_extras {
            msg.add_name_server(Record::from_rdata(
                owner.clone(),
                ttl + 100,
                RData::NS(NS(Name::from_ascii("ns1.example.cn.").unwrap())),
            ));
            msg.add_additional(Record::from_rdata(
                Name::from_ascii("ns1.example.cn.").unwrap(),
                ttl + 200,
                RData::A(A::new(10, 0, 0, 1)),
            ));
        }
        msg.to_bytes().unwrap()
    }

    #[test]
    fn parse_quick_extracts_normalized_first_question() {
        let packet = query_packet("WWW.Example.CN.", RecordType::A, 0xBEEF);
        let mut buf = [0u8; 256];
        let q = parse_quick(&packet, &mut buf).expect("parse");
        assert_eq!(q.tx_id, 0xBEEF);
        assert_eq!(q.qd_count, 1);
        assert_eq!(q.qname, "www.example.cn");
        assert_eq!(q.qtype, u16::from(RecordType::A));
    }

    #[test]
    fn parse_quick_rejects_empty_question_section() {
        let mut msg = Message::new();
        msg.set_id(7);
        let packet = msg.to_bytes().unwrap();
        let mut buf = [0u8; 256];
        assert!(parse_quick(&packet, &mut buf).is_none());
    }

    #[test]
    fn parse_quick_rejects_truncated_packet() {
        let packet = query_packet("example.cn.", RecordType::A, 1);
        let mut buf = [0u8; 256];
        assert!(parse_quick(&packet[..10], &mut buf).is_none());
        assert!(parse_quick(&packet[..packet.len() - 3], &mut buf).is_none());
    }

    #[test]
    fn first_answer_ttl_reads_first_answer_verbatim() {
        let packet = response_packet("example.cn.", 300, true);
        assert_eq!(first_answer_ttl(&packet), 300);
    }

    #[test]
    fn first_answer_ttl_is_zero_without_answers() {
        let mut msg = Message::new();
        msg.set_message_type(MessageType::Response);
        msg.add_query(Query::query(
            Name::from_ascii("example.cn.").unwrap(),
            RecordType::A,
        ));
        let packet = msg.to_bytes().unwrap();
        assert_eq!(first_answer_ttl(&packet), 0);
    }

    #[test]
    fn seal_response_rewrites_id_and_all_section_ttls() {
        let packet = response_packet("example.cn.", 300, true);
        let sealed = seal_response(&packet, 0x4242, 290).expect("seal");
        let msg = Message::from_bytes(&sealed).expect("reparse");
        assert_eq!(msg.id(), 0x4242);
        for record in msg
            .answers()
            .iter()
            .chain(msg.name_servers())
            .chain(msg.additionals())
        {
            assert_eq!(record.ttl(), 290);
        }
    }

    #[test]
    fn seal_response_zeroes_ttls_on_stale_serve() {
        let packet = response_packet("example.cn.", 300, true);
        let sealed = seal_response(&packet, 1, 0).expect("seal");
        let msg = Message::from_bytes(&sealed).expect("reparse");
        for record in msg.answers() {
            assert_eq!(record.ttl(), 0);
        }
    }

    #[test]
    fn patch_id_touches_only_the_header() {
        let mut packet = response_packet("example.cn.", 60, false);
        let original_tail = packet[2..].to_vec();
        patch_id(&mut packet, 0xA5A5);
        assert_eq!(&packet[0..2], &[0xA5, 0xA5]);
        assert_eq!(&packet[2..], &original_tail[..]);
    }
}
