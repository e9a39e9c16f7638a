pub mod jws_signer;
