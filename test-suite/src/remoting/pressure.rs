mod test_shutdown;
