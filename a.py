print('a')
=== END FILE ===