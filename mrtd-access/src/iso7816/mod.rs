pub mod apdu;
pub mod card;
