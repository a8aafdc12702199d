use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mailnet::dns::framing::{self, Frame, FrameDecoder};
use mailnet::AddressCandidate;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

fn wire(count: u16) -> Vec<u8> {
    let mut out = Vec::new();
    for i in 0..count {
        let ip = if i % 2 == 0 {
            IpAddr::V4(Ipv4Addr::new(198, 51, 100, (i % 250) as u8))
        } else {
            IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, i))
        };
        framing::encode_candidate(&AddressCandidate::from_socket_addr(SocketAddr::new(ip, 993)), &mut out);
    }
    out
}

fn benchmark_decode_all(c: &mut Criterion) {
    let data = wire(64);

    c.bench_function("framing_decode_all_64", |b| {
        b.iter(|| {
            let candidates = framing::decode_all("mail.example.com", black_box(&data)).unwrap();
            black_box(candidates);
        })
    });
}

fn benchmark_incremental_decode(c: &mut Criterion) {
    let data = wire(64);

    c.bench_function("framing_incremental_64", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new("mail.example.com");
            let mut count = 0;
            for chunk in data.chunks(37) {
                decoder.feed(chunk);
                while let Ok(Some(Frame::Candidate(candidate))) = decoder.next_frame() {
                    black_box(candidate);
                    count += 1;
                }
            }
            black_box(count);
        })
    });
}

criterion_group!(benches, benchmark_decode_all, benchmark_incremental_decode);
criterion_main!(benches);
