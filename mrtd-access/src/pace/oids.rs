//! Object identifiers of the PACE protocol variants (BSI TR-03110 Part 3 § A.1.1.1).
//!
//! The identifiers have the structure `id-PACE.mapping.cipher`, where `mapping` selects the key
//! agreement and mapping (1 = DH-GM, 2 = ECDH-GM, 3 = DH-IM, 4 = ECDH-IM, 6 = ECDH-CAM) and `cipher`
//! the cipher suite (1 = 3DES, 2 = AES-128, 3 = AES-192, 4 = AES-256).


use rasn::types::Oid;


macro_rules! pace_oid {
    ($name:ident $(, $number:expr)* $(,)?) => {
        pub const $name: &'static Oid = Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 4 $(, $number)*]);
    };
}

pace_oid!(ID_PACE);

pace_oid!(PACE_DH_GM_3DES_CBC_CBC,          1, 1);
pace_oid!(PACE_DH_GM_AES_CBC_CMAC_128,      1, 2);
pace_oid!(PACE_DH_GM_AES_CBC_CMAC_192,      1, 3);
pace_oid!(PACE_DH_GM_AES_CBC_CMAC_256,      1, 4);

pace_oid!(PACE_ECDH_GM_3DES_CBC_CBC,        2, 1);
pace_oid!(PACE_ECDH_GM_AES_CBC_CMAC_128,    2, 2);
pace_oid!(PACE_ECDH_GM_AES_CBC_CMAC_192,    2, 3);
pace_oid!(PACE_ECDH_GM_AES_CBC_CMAC_256,    2, 4);

pace_oid!(PACE_DH_IM_3DES_CBC_CBC,          3, 1);
pace_oid!(PACE_DH_IM_AES_CBC_CMAC_128,      3, 2);
pace_oid!(PACE_DH_IM_AES_CBC_CMAC_192,      3, 3);
pace_oid!(PACE_DH_IM_AES_CBC_CMAC_256,      3, 4);

pace_oid!(PACE_ECDH_IM_3DES_CBC_CBC,        4, 1);
pace_oid!(PACE_ECDH_IM_AES_CBC_CMAC_128,    4, 2);
pace_oid!(PACE_ECDH_IM_AES_CBC_CMAC_192,    4, 3);
pace_oid!(PACE_ECDH_IM_AES_CBC_CMAC_256,    4, 4);

// 5 is unused (theoretically DH-CAM), as is 6.1 (ECDH-CAM with 3DES)
pace_oid!(PACE_ECDH_CAM_AES_CBC_CMAC_128,   6, 2);
pace_oid!(PACE_ECDH_CAM_AES_CBC_CMAC_192,   6, 3);
pace_oid!(PACE_ECDH_CAM_AES_CBC_CMAC_256,   6, 4);


/// The arcs following `id-PACE` in a protocol identifier, or `None` if the identifier does not
/// denote a PACE protocol variant.
pub(crate) fn pace_arcs(oid: &Oid) -> Option<(u32, u32)> {
    let prefix: &[u32] = ID_PACE;
    let arcs: &[u32] = oid;
    match arcs.strip_prefix(prefix) {
        Some(&[mapping, cipher]) => Some((mapping, cipher)),
        _ => None,
    }
}
