//! Milenage authentication functions f1..f5 (3GPP TS 35.206) over AES-128.

use aes::Aes128;

use crate::crypto::{aes_cipher, aes_encrypt_block};

/// Operator variant constant used by the pod.
pub const POD_OP: [u8; 16] = [
    0xcd, 0xc2, 0x02, 0xd5, 0x12, 0x3e, 0x20, 0xf6, 0x2b, 0x6d, 0x67, 0x6a, 0xc7, 0x2c, 0xb3, 0x18,
];

/// Authentication management field used by the pod.
pub const POD_AMF: [u8; 2] = [0xb9, 0xb9];

const R1: usize = 64;
const R2: usize = 0;
const R3: usize = 32;
const R4: usize = 64;

/// Outputs of f2..f5 for one RAND.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vectors {
    pub res: [u8; 8],
    pub ck: [u8; 16],
    pub ik: [u8; 16],
    pub ak: [u8; 6],
}

pub struct Milenage {
    cipher: Aes128,
    opc: [u8; 16],
}

impl Milenage {
    /// Milenage keyed with `k` and the pod's OP.
    pub fn new(k: &[u8; 16]) -> Self {
        Self::with_op(k, &POD_OP)
    }

    pub fn with_op(k: &[u8; 16], op: &[u8; 16]) -> Self {
        let cipher = aes_cipher(k);
        let opc = xor(&aes_encrypt_block(&cipher, op), op);
        Self { cipher, opc }
    }

    pub fn opc(&self) -> &[u8; 16] {
        &self.opc
    }

    /// Network authentication code MAC-A.
    pub fn f1(&self, rand: &[u8; 16], sqn: &[u8; 6], amf: &[u8; 2]) -> [u8; 8] {
        let temp = self.temp(rand);
        let mut in1 = [0u8; 16];
        in1[..6].copy_from_slice(sqn);
        in1[6..8].copy_from_slice(amf);
        in1[8..14].copy_from_slice(sqn);
        in1[14..].copy_from_slice(amf);
        let rotated = rot(&xor(&in1, &self.opc), R1);
        let out1 = xor(&aes_encrypt_block(&self.cipher, &xor(&temp, &rotated)), &self.opc);
        let mut mac = [0u8; 8];
        mac.copy_from_slice(&out1[..8]);
        mac
    }

    /// RES, CK, IK and AK for one challenge.
    pub fn f2345(&self, rand: &[u8; 16]) -> Vectors {
        let temp = self.temp(rand);
        let out2 = self.out(&temp, R2, 1);
        let out3 = self.out(&temp, R3, 2);
        let out4 = self.out(&temp, R4, 4);
        let mut res = [0u8; 8];
        res.copy_from_slice(&out2[8..]);
        let mut ak = [0u8; 6];
        ak.copy_from_slice(&out2[..6]);
        Vectors {
            res,
            ck: out3,
            ik: out4,
            ak,
        }
    }

    fn temp(&self, rand: &[u8; 16]) -> [u8; 16] {
        aes_encrypt_block(&self.cipher, &xor(rand, &self.opc))
    }

    fn out(&self, temp: &[u8; 16], r: usize, c: u8) -> [u8; 16] {
        let mut x = rot(&xor(temp, &self.opc), r);
        x[15] ^= c;
        xor(&aes_encrypt_block(&self.cipher, &x), &self.opc)
    }
}

fn xor(a: &[u8; 16], b: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Cyclic left rotation by `bits` (a multiple of 8).
fn rot(x: &[u8; 16], bits: usize) -> [u8; 16] {
    let shift = bits / 8;
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = x[(i + shift) % 16];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h<const N: usize>(s: &str) -> [u8; N] {
        hex::decode(s).unwrap().try_into().unwrap()
    }

    // 3GPP TS 35.207 test set 1
    fn test_set_1() -> Milenage {
        Milenage::with_op(
            &h("465b5ce8b199b49faa5f0a2ee238a6bc"),
            &h("cdc202d5123e20f62b6d676ac72cb318"),
        )
    }

    #[test]
    fn opc_matches_test_set() {
        assert_eq!(test_set_1().opc(), &h::<16>("cd63cb71954a9f4e48a5994e37a02baf"));
    }

    #[test]
    fn f1_matches_test_set() {
        let m = test_set_1();
        let mac = m.f1(
            &h("23553cbe9637a89d218ae64dae47bf35"),
            &h("ff9bb4d0b607"),
            &h("b9b9"),
        );
        assert_eq!(mac, h::<8>("4a9ffac354dfafb3"));
    }

    #[test]
    fn f2345_matches_test_set() {
        let v = test_set_1().f2345(&h("23553cbe9637a89d218ae64dae47bf35"));
        assert_eq!(v.res, h::<8>("a54211d5e3ba50bf"));
        assert_eq!(v.ck, h::<16>("b40ba9a3c58b2a05bbf0d987b21bf8cb"));
        assert_eq!(v.ik, h::<16>("f769bcd751044604127672711c6d3441"));
        assert_eq!(v.ak, h::<6>("aa689c648370"));
    }

    #[test]
    fn pod_constants_are_test_set_op_and_amf() {
        assert_eq!(POD_OP, h::<16>("cdc202d5123e20f62b6d676ac72cb318"));
        assert_eq!(POD_AMF, h::<2>("b9b9"));
    }
}
