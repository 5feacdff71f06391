pub mod controller;
pub mod registry;
pub mod transfer;

#[cfg(test)]
mod test_support;
