use appvisor_core::profile_lock::{ProfileLock, LOCK_FILE_NAME};
use appvisor_core::secret;
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn racing_acquirers_see_exactly_one_winner() {
    for round in 0..20 {
        let dir = tempfile::tempdir().expect("tempdir");
        let profile = dir.path().join(format!("profile-{round}"));
        let contenders = 8;
        let barrier = Arc::new(Barrier::new(contenders));

        let handles: Vec<_> = (0..contenders)
            .map(|_| {
                let barrier = barrier.clone();
                let profile = profile.clone();
                thread::spawn(move || {
                    let mut lock = ProfileLock::for_profile(&profile);
                    barrier.wait();
                    let won = lock.acquire().expect("acquire");
                    // Hold the lock until every contender has tried.
                    (won, lock)
                })
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().expect("join contender"))
            .collect();
        let winners = results.iter().filter(|(won, _)| *won).count();
        assert_eq!(winners, 1, "round {round}");
        assert!(profile.join(LOCK_FILE_NAME).exists());

        drop(results);
        assert!(!profile.join(LOCK_FILE_NAME).exists());
    }
}

#[test]
fn instances_sharing_a_root_share_the_secret() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = secret::secret_path(dir.path());

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let path = path.clone();
            thread::spawn(move || secret::load_or_create(&path).expect("secret"))
        })
        .collect();
    let tokens: Vec<String> = handles
        .into_iter()
        .map(|handle| handle.join().expect("join"))
        .collect();
    assert!(tokens.windows(2).all(|pair| pair[0] == pair[1]));
}
