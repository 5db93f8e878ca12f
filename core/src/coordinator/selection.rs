use rand::seq::SliceRandom;
use zelana_pubkey::Pubkey;

/// Picks the worker credited for a session among those with a valid proof.
///
/// Uniform random. This is the single place a reward mechanism would plug in.
pub fn select_winner(valid: &[Pubkey]) -> Option<Pubkey> {
    valid.choose(&mut rand::thread_rng()).copied()
}
