// FIPS 180-4 SHA-1, streaming, with a cheaply clonable mid-digest state so the minting engine
// can hash a common token prefix once and fan out over many counter suffixes.

const H0: [u32; 5] = [0x67452301, 0xefcdab89, 0x98badcfe, 0x10325476, 0xc3d2e1f0];

#[derive(Clone)]
pub struct Sha1 {
  digest: [u32; 5],
  block: [u8; 64],
  size: u64,
}

pub type Digest = [u8; 20];

impl Sha1 {
  pub fn begin() -> Self {
    Sha1 {
      digest: H0,
      block: [0; 64],
      size: 0,
    }
  }

  pub fn feed_byte(&mut self, byte: u8) {
    let position = (self.size % 64) as usize;
    self.block[position] = byte;
    self.size += 1;
    if self.size % 64 == 0 {
      self.compress();
    }
  }

  pub fn feed_bytes(&mut self, bytes: &[u8]) {
    for &byte in bytes {
      self.feed_byte(byte);
    }
  }

  pub fn finalize(mut self) -> Digest {
    let bit_length = self.size * 8;
    self.feed_byte(0x80);
    while self.size % 64 != 56 {
      self.feed_byte(0);
    }
    for shift in [56, 48, 40, 32, 24, 16, 8, 0] {
      self.feed_byte((bit_length >> shift) as u8);
    }
    let mut out = [0u8; 20];
    for (word, chunk) in self.digest.iter().zip(out.chunks_exact_mut(4)) {
      chunk.copy_from_slice(&word.to_be_bytes());
    }
    out
  }

  fn compress(&mut self) {
    let mut w = [0u32; 80];
    for (word, chunk) in w.iter_mut().zip(self.block.chunks_exact(4)) {
      *word = u32::from_be_bytes(chunk.try_into().unwrap());
    }
    for i in 16..80 {
      w[i] = (w[i - 3] ^ w[i - 8] ^ w[i - 14] ^ w[i - 16]).rotate_left(1);
    }

    let [mut a, mut b, mut c, mut d, mut e] = self.digest;
    for (i, &wi) in w.iter().enumerate() {
      let (f, k) = match i {
        0..=19 => ((b & c) | (!b & d), 0x5a827999u32),
        20..=39 => (b ^ c ^ d, 0x6ed9eba1),
        40..=59 => ((b & c) | (b & d) | (c & d), 0x8f1bbcdc),
        _ => (b ^ c ^ d, 0xca62c1d6),
      };
      let temp = a
        .rotate_left(5)
        .wrapping_add(f)
        .wrapping_add(e)
        .wrapping_add(k)
        .wrapping_add(wi);
      e = d;
      d = c;
      c = b.rotate_left(30);
      b = a;
      a = temp;
    }

    self.digest[0] = self.digest[0].wrapping_add(a);
    self.digest[1] = self.digest[1].wrapping_add(b);
    self.digest[2] = self.digest[2].wrapping_add(c);
    self.digest[3] = self.digest[3].wrapping_add(d);
    self.digest[4] = self.digest[4].wrapping_add(e);
  }
}

/// Number of leading zero bits in a digest, saturating at `digest.len() * 8`.
pub fn leading_zero_bits(digest: &Digest) -> u32 {
  let mut bits = 0;
  for &byte in digest {
    if byte == 0 {
      bits += 8;
      continue;
    }
    bits += byte.leading_zeros();
    break;
  }
  bits
}

// Known-answer self-test data lifted verbatim from the reference implementation: hashing a
// fixed 65-character string repeated to lengths 0..195 must reproduce four literal digests and
// an XOR fingerprint over all 196. Exercises the incremental feed/clone contract the minting
// engine itself depends on.
const CHECK_DATA: &str = "cqlbzjiheywnpfktxrgmvuodasXFQVNAOTGDMSWIBPJCHRLUKZEY4268710935+=/";

const CHECK_HASH: [Digest; 4] = [
  hex_digest("da39a3ee5e6b4b0d3255bfef95601890afd80709"),
  hex_digest("84a516841ba77a5b4648de2cd0dfcb30ea46dbb4"),
  hex_digest("018d644a17b71b65cef51fa0a523a293f2b3266f"),
  hex_digest("fdd400e5cc6573858bf7a3df79d50cf2d57be9be"),
];

const CHECK_XOR: Digest = hex_digest("afb2c16c3b093896631b16e76cbf125adc58ec67");

const fn hex_value(byte: u8) -> u8 {
  match byte {
    b'0'..=b'9' => byte - b'0',
    b'a'..=b'f' => byte - b'a' + 10,
    _ => panic!("invalid hex digit in SHA-1 self-test literal"),
  }
}

const fn hex_digest(hex: &str) -> Digest {
  let hex = hex.as_bytes();
  assert!(hex.len() == 40, "self-test literal must be 40 hex digits");
  let mut out = [0u8; 20];
  let mut i = 0;
  while i < 20 {
    out[i] = hex_value(hex[2 * i]) << 4 | hex_value(hex[2 * i + 1]);
    i += 1;
  }
  out
}

/// Runs the startup known-answer test; failure is fatal, per the SHA-1 core contract.
pub fn self_test() -> anyhow::Result<()> {
  let mut xor = [0u8; 20];
  for i in 0..196usize {
    let mut sha1 = Sha1::begin();
    let mut remaining = i;
    while remaining > 0 {
      let take = remaining.min(CHECK_DATA.len());
      sha1.feed_bytes(&CHECK_DATA.as_bytes()[..take]);
      remaining -= take;
    }
    let digest = sha1.finalize();
    if let Some(expected) = CHECK_HASH.get(i) {
      anyhow::ensure!(
        digest == *expected,
        "SHA-1 self-test failed at checkpoint {i}"
      );
    }
    for (x, byte) in xor.iter_mut().zip(digest) {
      *x ^= byte;
    }
  }
  anyhow::ensure!(xor == CHECK_XOR, "SHA-1 self-test XOR fingerprint mismatch");
  Ok(())
}
