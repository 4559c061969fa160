macro_rules! expand_levels {
    ($($level:ident),+$(,)?) => {
        $(
            #[test]
            fn $level() {
                let machine = 3;
                logger::$level!("Mailbox ready.");
                logger::$level!("Mailbox {} ready on machine {}.", 1, machine);
                logger::$level!("Mailbox {box_id} ready on machine {machine}.", box_id = 2);
            }
        )*
    };
}

expand_levels!(trace, debug, info, warn, error,);
